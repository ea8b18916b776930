//! Cascading subtree deletion.

use super::TreeMaintainer;
use crate::error::{Result, TagError};
use crate::repository::TagRepository;
use crate::types::{ScopeId, Tag, TagId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Outcome of a cascading delete.
#[derive(Clone, Debug, Default)]
pub struct RemovedSubtree {
    /// Last stored state of every deleted tag, root first.
    pub deleted: Vec<Tag>,

    /// Surviving ancestors of the root after pruning, nearest first.
    pub ancestors: Vec<Tag>,
}

impl RemovedSubtree {
    /// Deleted ids, root first.
    pub fn ids(&self) -> Vec<TagId> {
        self.deleted.iter().map(|tag| tag.id).collect()
    }

    /// Scopes whose listings changed: those of the deleted tags and of the
    /// ancestors whose descendant sets shrank.
    pub fn scopes(&self) -> BTreeSet<ScopeId> {
        self.deleted
            .iter()
            .chain(&self.ancestors)
            .flat_map(|tag| tag.scopes.iter().cloned())
            .collect()
    }
}

/// Deletes a tag together with everything below it.
///
/// Ordering contract for [`SubtreeDeleter::delete_subtree`]:
/// 1. descendants are removed bottom-up (each child after its own subtree)
/// 2. every collected id is pruned from the ancestors of the root
/// 3. the root record itself is removed last
///
/// Descendants are discovered through `find_by_parent`, never through the
/// denormalized `children` set, so stale sets cannot hide a subtree.
pub struct SubtreeDeleter<R> {
    repo: Arc<R>,
    maintainer: TreeMaintainer<R>,
}

impl<R: TagRepository> SubtreeDeleter<R> {
    pub fn new(repo: Arc<R>, maintainer: TreeMaintainer<R>) -> Self {
        Self { repo, maintainer }
    }

    /// Delete `root` and its subtree. Returns every deleted id, root first,
    /// then descendants in discovery order.
    ///
    /// The root may already be gone from the repository (the `tag_delete`
    /// hook fires after the record is removed); its snapshot is enough to
    /// find the subtree and the ancestor chain.
    ///
    /// On error the walk stops where it failed: some descendants may be gone
    /// while ancestor sets still list them. Callers must surface that.
    pub fn delete_subtree(&self, root: &Tag) -> Result<Vec<TagId>> {
        Ok(self.remove_subtree(root)?.ids())
    }

    /// Same as [`delete_subtree`](Self::delete_subtree), returning the last
    /// stored state of every deleted tag and the pruned ancestors.
    pub fn remove_subtree(&self, root: &Tag) -> Result<RemovedSubtree> {
        let mut collected = vec![root.clone()];
        self.delete_descendants(root.id, &mut collected, 0)?;

        let ids: BTreeSet<TagId> = collected.iter().map(|tag| tag.id).collect();
        let ancestors = self.maintainer.prune_descendants(root.parent, &ids)?;

        if !self.repo.delete(root.id)? {
            debug!(tag = %root.id, "root record already removed");
        }

        debug!(tag = %root.id, deleted = collected.len(), "subtree deleted");
        Ok(RemovedSubtree {
            deleted: collected,
            ancestors,
        })
    }

    /// Post-order removal of everything below `id`.
    fn delete_descendants(&self, id: TagId, collected: &mut Vec<Tag>, depth: usize) -> Result<()> {
        if depth >= self.maintainer.max_depth() {
            return Err(TagError::CycleDetected { id, depth });
        }

        for child in self.repo.find_by_parent(id)? {
            let child_id = child.id;
            collected.push(child);
            self.delete_descendants(child_id, collected, depth + 1)?;
            self.repo.delete(child_id)?;
        }

        Ok(())
    }
}
