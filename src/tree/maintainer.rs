//! Ancestor descendant-set maintenance.

use crate::error::{Result, TagError};
use crate::repository::TagRepository;
use crate::types::{Tag, TagId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Default bound on ancestor chain length before a walk is treated as a cycle.
pub const DEFAULT_MAX_DEPTH: usize = 1024;

/// Keeps every ancestor's `children` set in step with the tags below it.
///
/// Walks go strictly from the mutated tag outward to the root, one
/// repository write per ancestor. If a write fails at depth k, ancestors
/// below k are already updated and the rest are untouched; both walks are
/// idempotent, so the caller can retry the whole walk.
pub struct TreeMaintainer<R> {
    repo: Arc<R>,
    max_depth: usize,
}

impl<R> Clone for TreeMaintainer<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            max_depth: self.max_depth,
        }
    }
}

impl<R: TagRepository> TreeMaintainer<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self::with_max_depth(repo, DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(repo: Arc<R>, max_depth: usize) -> Self {
        Self {
            repo,
            max_depth: max_depth.max(1),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Add a newly created tag's id to every ancestor.
    ///
    /// Each ancestor also receives the ids of the ancestors already visited
    /// below it. Stops at a root or at a parent reference that no longer
    /// resolves. Returns the ancestors as updated, nearest first.
    pub fn on_create(&self, tag: &Tag) -> Result<Vec<Tag>> {
        self.add_to_ancestors(tag.id, tag.parent, vec![tag.id])
    }

    /// Add a whole subtree (the tag and its descendants) to the ancestors
    /// above `tag.parent`. Used when a tag is attached under a new parent.
    pub fn attach_subtree(&self, tag: &Tag) -> Result<Vec<Tag>> {
        self.add_to_ancestors(tag.id, tag.parent, tag.subtree_ids().into_iter().collect())
    }

    /// Remove `ids` from every ancestor, starting at `from` and moving up.
    ///
    /// `from` is the parent of the tag whose subtree went away. Returns the
    /// ancestors as updated, nearest first.
    pub fn prune_descendants(
        &self,
        from: Option<TagId>,
        ids: &BTreeSet<TagId>,
    ) -> Result<Vec<Tag>> {
        let mut touched = Vec::new();
        let mut next = from;

        while let Some(ancestor_id) = next {
            self.check_depth(ancestor_id, touched.len())?;

            match self.repo.remove_descendants(ancestor_id, ids)? {
                Some(ancestor) => {
                    next = ancestor.parent;
                    touched.push(ancestor);
                }
                None => {
                    debug!(ancestor = %ancestor_id, "missing ancestor, prune walk stopped");
                    break;
                }
            }
        }

        Ok(touched)
    }

    /// Remove a subtree from the ancestors above `tag.parent`. Used before a
    /// tag is moved away from its current parent.
    pub fn detach_subtree(&self, tag: &Tag) -> Result<Vec<Tag>> {
        self.prune_descendants(tag.parent, &tag.subtree_ids())
    }

    fn add_to_ancestors(
        &self,
        origin: TagId,
        parent: Option<TagId>,
        mut ids: Vec<TagId>,
    ) -> Result<Vec<Tag>> {
        let mut touched = Vec::new();
        let mut next = parent;

        while let Some(ancestor_id) = next {
            self.check_depth(ancestor_id, touched.len())?;

            match self.repo.add_descendants(ancestor_id, &ids)? {
                Some(ancestor) => {
                    ids.push(ancestor.id);
                    next = ancestor.parent;
                    touched.push(ancestor);
                }
                None => {
                    debug!(
                        tag = %origin,
                        ancestor = %ancestor_id,
                        "missing ancestor, detached branch"
                    );
                    break;
                }
            }
        }

        Ok(touched)
    }

    fn check_depth(&self, at: TagId, depth: usize) -> Result<()> {
        if depth >= self.max_depth {
            return Err(TagError::CycleDetected { id: at, depth });
        }
        Ok(())
    }
}
