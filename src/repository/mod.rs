//! Tag repositories.
//!
//! The tree algorithms only talk to a [`TagRepository`]. Two backends ship
//! with the crate:
//! - [`MemoryTagRepository`]: in-process maps, for tests and caches
//! - [`FileTagRepository`]: a checksummed journal replayed on open
//!
//! Both perform descendant-set union and filtering under their own write
//! lock, so concurrent creates under a shared ancestor never lose an id.

mod file;
mod memory;
mod table;

pub use file::{FileRepositoryConfig, FileTagRepository};
pub use memory::MemoryTagRepository;
pub use table::TagTable;

use crate::error::{Result, TagError};
use crate::types::{ScopeId, Tag, TagFilter, TagId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Key-addressed tag storage.
///
/// No transactionality is assumed across calls. The provided
/// `save_fields`, `add_descendants` and `remove_descendants` fall back to
/// read-modify-write;
/// backends that can do the update atomically should override them.
pub trait TagRepository: Send + Sync {
    /// Fetch a tag by id.
    fn find_by_id(&self, id: TagId) -> Result<Option<Tag>>;

    /// Direct children only, resolved from `parent` pointers.
    fn find_by_parent(&self, parent: TagId) -> Result<Vec<Tag>>;

    /// Tags applying to `scope`, sorted by `order` then id.
    fn find_by_scope(&self, scope: &ScopeId, filter: &TagFilter) -> Result<Vec<Tag>>;

    /// Insert or replace a tag.
    fn save(&self, tag: &Tag) -> Result<()>;

    /// Remove a tag. Returns false if it did not exist.
    fn delete(&self, id: TagId) -> Result<bool>;

    /// Every stored tag.
    fn all(&self) -> Result<Vec<Tag>>;

    /// Allocate a fresh tag id.
    fn next_id(&self) -> Result<TagId>;

    /// Save every field of `tag` except its descendant set, which keeps its
    /// stored value.
    ///
    /// Returns the tag as stored, or `None` if it does not exist.
    fn save_fields(&self, tag: &Tag) -> Result<Option<Tag>> {
        let Some(stored) = self.find_by_id(tag.id)? else {
            return Ok(None);
        };
        let mut updated = tag.clone();
        updated.children = stored.children;
        self.save(&updated)?;
        Ok(Some(updated))
    }

    /// Union `ids` into the descendant set of `id`.
    ///
    /// Returns the updated tag, or `None` if `id` does not exist.
    fn add_descendants(&self, id: TagId, ids: &[TagId]) -> Result<Option<Tag>> {
        let Some(mut tag) = self.find_by_id(id)? else {
            return Ok(None);
        };
        tag.children.extend(ids.iter().copied());
        self.save(&tag)?;
        Ok(Some(tag))
    }

    /// Remove `ids` from the descendant set of `id`.
    ///
    /// Returns the updated tag, or `None` if `id` does not exist.
    fn remove_descendants(&self, id: TagId, ids: &BTreeSet<TagId>) -> Result<Option<Tag>> {
        let Some(mut tag) = self.find_by_id(id)? else {
            return Ok(None);
        };
        tag.children.retain(|child| !ids.contains(child));
        self.save(&tag)?;
        Ok(Some(tag))
    }

    /// Ancestor chain of `id`, nearest first, stopping at a root or a
    /// missing parent. Fails with `CycleDetected` past `max_depth`.
    fn ancestors(&self, id: TagId, max_depth: usize) -> Result<Vec<Tag>> {
        let mut chain = Vec::new();
        let mut next = match self.find_by_id(id)? {
            Some(tag) => tag.parent,
            None => return Ok(chain),
        };

        while let Some(parent_id) = next {
            if chain.len() >= max_depth {
                return Err(TagError::CycleDetected {
                    id: parent_id,
                    depth: chain.len(),
                });
            }
            match self.find_by_id(parent_id)? {
                Some(parent) => {
                    next = parent.parent;
                    chain.push(parent);
                }
                None => break,
            }
        }

        Ok(chain)
    }
}

impl<R: TagRepository + ?Sized> TagRepository for Arc<R> {
    fn find_by_id(&self, id: TagId) -> Result<Option<Tag>> {
        (**self).find_by_id(id)
    }

    fn find_by_parent(&self, parent: TagId) -> Result<Vec<Tag>> {
        (**self).find_by_parent(parent)
    }

    fn find_by_scope(&self, scope: &ScopeId, filter: &TagFilter) -> Result<Vec<Tag>> {
        (**self).find_by_scope(scope, filter)
    }

    fn save(&self, tag: &Tag) -> Result<()> {
        (**self).save(tag)
    }

    fn delete(&self, id: TagId) -> Result<bool> {
        (**self).delete(id)
    }

    fn all(&self) -> Result<Vec<Tag>> {
        (**self).all()
    }

    fn next_id(&self) -> Result<TagId> {
        (**self).next_id()
    }

    fn save_fields(&self, tag: &Tag) -> Result<Option<Tag>> {
        (**self).save_fields(tag)
    }

    fn add_descendants(&self, id: TagId, ids: &[TagId]) -> Result<Option<Tag>> {
        (**self).add_descendants(id, ids)
    }

    fn remove_descendants(&self, id: TagId, ids: &BTreeSet<TagId>) -> Result<Option<Tag>> {
        (**self).remove_descendants(id, ids)
    }

    fn ancestors(&self, id: TagId, max_depth: usize) -> Result<Vec<Tag>> {
        (**self).ancestors(id, max_depth)
    }
}
