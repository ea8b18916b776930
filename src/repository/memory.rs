//! In-memory tag repository.

use super::{TagRepository, TagTable};
use crate::error::Result;
use crate::types::{ScopeId, Tag, TagFilter, TagId};
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Tag repository backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryTagRepository {
    table: RwLock<TagTable>,
}

impl MemoryTagRepository {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(TagTable::new()),
        }
    }

    /// Seed a repository with existing tags (ids are kept as given).
    pub fn with_tags(tags: impl IntoIterator<Item = Tag>) -> Self {
        let mut table = TagTable::new();
        for tag in tags {
            table.insert(tag);
        }
        Self {
            table: RwLock::new(table),
        }
    }

    /// Number of stored tags.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

impl TagRepository for MemoryTagRepository {
    fn find_by_id(&self, id: TagId) -> Result<Option<Tag>> {
        Ok(self.table.read().get(id).cloned())
    }

    fn find_by_parent(&self, parent: TagId) -> Result<Vec<Tag>> {
        Ok(self.table.read().children_of(parent))
    }

    fn find_by_scope(&self, scope: &ScopeId, filter: &TagFilter) -> Result<Vec<Tag>> {
        Ok(self.table.read().in_scope(scope, filter))
    }

    fn save(&self, tag: &Tag) -> Result<()> {
        self.table.write().insert(tag.clone());
        Ok(())
    }

    fn delete(&self, id: TagId) -> Result<bool> {
        Ok(self.table.write().remove(id).is_some())
    }

    fn all(&self) -> Result<Vec<Tag>> {
        Ok(self.table.read().all())
    }

    fn next_id(&self) -> Result<TagId> {
        self.table.write().allocate_id()
    }

    fn save_fields(&self, tag: &Tag) -> Result<Option<Tag>> {
        Ok(self.table.write().update_fields(tag))
    }

    fn add_descendants(&self, id: TagId, ids: &[TagId]) -> Result<Option<Tag>> {
        Ok(self.table.write().add_descendants(id, ids))
    }

    fn remove_descendants(&self, id: TagId, ids: &BTreeSet<TagId>) -> Result<Option<Tag>> {
        Ok(self.table.write().remove_descendants(id, ids))
    }
}
