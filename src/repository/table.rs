//! In-memory tag table shared by the repository backends.

use crate::error::{Result, TagError};
use crate::types::{ScopeId, Tag, TagFilter, TagId};
use std::collections::{BTreeSet, HashMap};

/// Tags by id plus a parent -> direct children index.
///
/// Not synchronized; backends wrap it in their own lock.
#[derive(Debug)]
pub struct TagTable {
    tags: HashMap<TagId, Tag>,
    by_parent: HashMap<TagId, BTreeSet<TagId>>,
    next_id: u64,
}

impl Default for TagTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TagTable {
    pub fn new() -> Self {
        Self {
            tags: HashMap::new(),
            by_parent: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn get(&self, id: TagId) -> Option<&Tag> {
        self.tags.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Insert or replace, keeping the parent index in step.
    pub fn insert(&mut self, tag: Tag) {
        if let Some(old) = self.tags.get(&tag.id) {
            if old.parent != tag.parent {
                if let Some(old_parent) = old.parent {
                    self.unlink(old_parent, tag.id);
                }
            }
        }
        if let Some(parent) = tag.parent {
            self.by_parent.entry(parent).or_default().insert(tag.id);
        }
        self.next_id = self.next_id.max(tag.id.0.saturating_add(1));
        self.tags.insert(tag.id, tag);
    }

    pub fn remove(&mut self, id: TagId) -> Option<Tag> {
        let tag = self.tags.remove(&id)?;
        if let Some(parent) = tag.parent {
            self.unlink(parent, id);
        }
        Some(tag)
    }

    fn unlink(&mut self, parent: TagId, child: TagId) {
        if let Some(children) = self.by_parent.get_mut(&parent) {
            children.remove(&child);
            if children.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
    }

    /// Direct children of `parent`, in id order.
    pub fn children_of(&self, parent: TagId) -> Vec<Tag> {
        self.by_parent
            .get(&parent)
            .map(|ids| ids.iter().filter_map(|id| self.tags.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Tags in `scope` matching `filter`, sorted by order then id.
    pub fn in_scope(&self, scope: &ScopeId, filter: &TagFilter) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self
            .tags
            .values()
            .filter(|tag| tag.scopes.contains(scope) && filter.matches(tag))
            .cloned()
            .collect();
        tags.sort_by_key(|tag| (tag.order, tag.id));
        tags
    }

    /// Every tag, in id order.
    pub fn all(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self.tags.values().cloned().collect();
        tags.sort_by_key(|tag| tag.id);
        tags
    }

    /// Hand out the next unused id. `u64::MAX` is never allocated.
    pub fn allocate_id(&mut self) -> Result<TagId> {
        if self.next_id == u64::MAX {
            return Err(TagError::IdsExhausted);
        }
        let id = TagId(self.next_id);
        self.next_id += 1;
        Ok(id)
    }

    /// Lowest id that has never been handed out or stored.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Raise the id high-water mark, never lowering it.
    pub fn reserve_ids(&mut self, next_id: u64) {
        self.next_id = self.next_id.max(next_id);
    }

    /// Replace everything but the descendant set of a stored tag.
    ///
    /// Returns the tag as stored, or `None` if it does not exist.
    pub fn update_fields(&mut self, tag: &Tag) -> Option<Tag> {
        let children = self.tags.get(&tag.id)?.children.clone();
        let mut updated = tag.clone();
        updated.children = children;
        self.insert(updated.clone());
        Some(updated)
    }

    /// Union `ids` into the descendant set of `id`. `None` if `id` is missing.
    pub fn add_descendants(&mut self, id: TagId, ids: &[TagId]) -> Option<Tag> {
        let tag = self.tags.get_mut(&id)?;
        tag.children.extend(ids.iter().copied());
        Some(tag.clone())
    }

    /// Remove `ids` from the descendant set of `id`. `None` if `id` is missing.
    pub fn remove_descendants(&mut self, id: TagId, ids: &BTreeSet<TagId>) -> Option<Tag> {
        let tag = self.tags.get_mut(&id)?;
        tag.children.retain(|child| !ids.contains(child));
        Some(tag.clone())
    }
}
