//! Tag index tying repository, tree maintenance and invalidation together.

use crate::error::{Result, TagError};
use crate::events::TagEvent;
use crate::projection::ProjectionCache;
use crate::registry::{InvalidationRegistry, RegistryConfig, SubscriptionId};
use crate::repository::TagRepository;
use crate::tree::{SubtreeDeleter, TreeMaintainer, DEFAULT_MAX_DEPTH};
use crate::types::{ScopeId, Tag, TagFilter, TagId, TagInput, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error};

/// Tag index configuration.
#[derive(Clone, Debug)]
pub struct TagIndexConfig {
    /// Longest ancestor chain accepted before a walk reports a cycle.
    pub max_depth: usize,

    /// Reject creates and moves whose parent does not exist.
    pub validate_parents: bool,

    /// Registry settings, used when the index creates its own registry.
    pub registry: RegistryConfig,
}

impl Default for TagIndexConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            validate_parents: true,
            registry: RegistryConfig::default(),
        }
    }
}

/// A broken structural invariant found by [`TagIndex::check_integrity`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// `descendant` sits below `ancestor` but is missing from its set.
    MissingDescendant { ancestor: TagId, descendant: TagId },
    /// `ancestor` lists `id`, which is not below it (or no longer exists).
    DanglingDescendant { ancestor: TagId, id: TagId },
    /// Following parents from `id` never reaches a root.
    Cycle { id: TagId },
}

/// The tag index.
///
/// Provides a unified interface for:
/// - Creating, updating and deleting tags with tree maintenance
/// - Handling mutation events for writes made elsewhere
/// - Notifying scope subscribers after every successful mutation
pub struct TagIndex<R> {
    config: TagIndexConfig,
    repo: Arc<R>,
    maintainer: TreeMaintainer<R>,
    deleter: SubtreeDeleter<R>,
    registry: Arc<InvalidationRegistry>,

    /// Serializes every mutation so validation sees a stable tree.
    write_lock: Mutex<()>,
}

impl<R: TagRepository + 'static> TagIndex<R> {
    /// Create an index with its own invalidation registry.
    pub fn new(repo: Arc<R>, config: TagIndexConfig) -> Result<Self> {
        let registry = Arc::new(InvalidationRegistry::with_config(config.registry.clone())?);
        Ok(Self::with_registry(repo, registry, config))
    }

    /// Create an index around a shared registry.
    pub fn with_registry(
        repo: Arc<R>,
        registry: Arc<InvalidationRegistry>,
        config: TagIndexConfig,
    ) -> Self {
        let maintainer = TreeMaintainer::with_max_depth(Arc::clone(&repo), config.max_depth);
        let deleter = SubtreeDeleter::new(Arc::clone(&repo), maintainer.clone());

        Self {
            config,
            repo,
            maintainer,
            deleter,
            registry,
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &TagIndexConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn registry(&self) -> &Arc<InvalidationRegistry> {
        &self.registry
    }

    pub fn maintainer(&self) -> &TreeMaintainer<R> {
        &self.maintainer
    }

    pub fn deleter(&self) -> &SubtreeDeleter<R> {
        &self.deleter
    }

    /// A projection cache sharing this index's repository and registry.
    pub fn projections(&self) -> ProjectionCache<R> {
        ProjectionCache::new(Arc::clone(&self.repo), Arc::clone(&self.registry))
    }

    /// Subscribe a recompute function for a scope's derived view.
    pub fn register_projection<F>(
        &self,
        scope: impl Into<ScopeId>,
        recompute: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        if self.registry.is_shut_down() {
            return Err(TagError::RegistryClosed);
        }
        Ok(self.registry.subscribe(scope, recompute))
    }

    // --- Queries ---

    pub fn get(&self, id: TagId) -> Result<Option<Tag>> {
        self.repo.find_by_id(id)
    }

    /// Direct children of `id`.
    pub fn children_of(&self, id: TagId) -> Result<Vec<Tag>> {
        self.repo.find_by_parent(id)
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: TagId) -> Result<Vec<Tag>> {
        self.repo.ancestors(id, self.config.max_depth)
    }

    pub fn list_scope(&self, scope: &ScopeId, filter: TagFilter) -> Result<Vec<Tag>> {
        self.repo.find_by_scope(scope, &filter)
    }

    // --- Mutations ---

    /// Create a tag, add it to every ancestor and notify its scopes.
    pub fn create(&self, input: TagInput) -> Result<Tag> {
        let _lock = self.write_lock.lock();

        if let Some(parent) = input.parent {
            self.require_parent(parent)?;
        }
        self.require_unique_url(None, input.url.as_deref())?;

        let tag = Tag::from_input(self.repo.next_id()?, input);
        self.repo.save(&tag)?;

        self.apply_event(TagEvent::Created { tag: tag.clone() })?;
        Ok(tag)
    }

    /// Save presentational or parent changes to an existing tag.
    ///
    /// The descendant set is owned by the index and cannot be changed
    /// here; the stored set is kept even if a walk extends it meanwhile.
    /// A parent change moves the whole subtree: its ids are pruned from the
    /// old ancestors and added to the new ones.
    pub fn update(&self, mut tag: Tag) -> Result<Tag> {
        let _lock = self.write_lock.lock();

        let previous = self
            .repo
            .find_by_id(tag.id)?
            .ok_or(TagError::TagNotFound(tag.id))?;

        tag.children = previous.children.clone();
        tag.created = previous.created;
        tag.updated = Timestamp::now();

        if tag.parent != previous.parent {
            self.validate_move(&tag)?;
        }
        if tag.url != previous.url {
            self.require_unique_url(Some(tag.id), tag.url.as_deref())?;
        }

        let stored = self
            .repo
            .save_fields(&tag)?
            .ok_or(TagError::TagNotFound(tag.id))?;

        self.apply_event(TagEvent::Updated {
            tag: stored.clone(),
            previous: Some(previous),
        })?;
        Ok(stored)
    }

    /// Delete a tag with its whole subtree. Returns every deleted id.
    pub fn delete(&self, id: TagId) -> Result<Vec<TagId>> {
        let _lock = self.write_lock.lock();

        let tag = self
            .repo
            .find_by_id(id)?
            .ok_or(TagError::TagNotFound(id))?;

        let removed = self.deleter.remove_subtree(&tag)?;
        self.notify_scopes(&removed.scopes());
        Ok(removed.ids())
    }

    /// Mutation hook for writes already persisted by someone else.
    ///
    /// Runs the tree maintenance for the event, then notifies every scope
    /// involved: the tag's own and those of every ancestor whose descendant
    /// set changed. Structural failures abort before any notification and
    /// are returned so the caller can retry the walk.
    pub fn handle(&self, event: TagEvent) -> Result<()> {
        let _lock = self.write_lock.lock();
        self.apply_event(event)
    }

    fn apply_event(&self, event: TagEvent) -> Result<()> {
        let result = match &event {
            TagEvent::Created { tag } => self.maintainer.on_create(tag).map(|ancestors| {
                let mut scopes = event.scopes();
                scopes.extend(tag_scopes(&ancestors));
                scopes
            }),
            TagEvent::Updated { tag, previous } => self.apply_update(tag, previous.as_ref()),
            TagEvent::Deleted { tag } => self.deleter.remove_subtree(tag).map(|r| r.scopes()),
        };

        match result {
            Ok(scopes) => {
                let dispatched = self.notify_scopes(&scopes);
                debug!(
                    event = event.name(),
                    tag = %event.tag().id,
                    scopes = scopes.len(),
                    dispatched,
                    "mutation applied"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    event = event.name(),
                    tag = %event.tag().id,
                    structural = e.is_structural(),
                    error = %e,
                    "tree maintenance failed"
                );
                Err(e)
            }
        }
    }

    fn apply_update(&self, tag: &Tag, previous: Option<&Tag>) -> Result<BTreeSet<ScopeId>> {
        let mut scopes = tag.scopes.clone();

        if let Some(previous) = previous {
            scopes.extend(previous.scopes.iter().cloned());

            if previous.parent != tag.parent {
                let detached = self.maintainer.detach_subtree(previous)?;
                scopes.extend(tag_scopes(&detached));

                let mut moved = tag.clone();
                moved.children.extend(previous.children.iter().copied());
                let attached = self.maintainer.attach_subtree(&moved)?;
                scopes.extend(tag_scopes(&attached));

                debug!(
                    tag = %tag.id,
                    from = ?previous.parent,
                    to = ?tag.parent,
                    "subtree moved"
                );
            }
        }

        Ok(scopes)
    }

    fn notify_scopes(&self, scopes: &BTreeSet<ScopeId>) -> usize {
        scopes.iter().map(|scope| self.registry.notify(scope)).sum()
    }

    /// Reject a url already used by a tag other than `id`.
    fn require_unique_url(&self, id: Option<TagId>, url: Option<&str>) -> Result<()> {
        let Some(url) = url else {
            return Ok(());
        };
        let taken = self
            .repo
            .all()?
            .into_iter()
            .any(|other| Some(other.id) != id && other.url.as_deref() == Some(url));
        if taken {
            return Err(TagError::DuplicateUrl(url.to_string()));
        }
        Ok(())
    }

    fn require_parent(&self, parent: TagId) -> Result<()> {
        if self.config.validate_parents && self.repo.find_by_id(parent)?.is_none() {
            return Err(TagError::ParentNotFound(parent));
        }
        Ok(())
    }

    /// Reject a new parent that is the tag itself or sits inside its subtree.
    fn validate_move(&self, tag: &Tag) -> Result<()> {
        let Some(parent) = tag.parent else {
            return Ok(());
        };

        let cycle = TagError::WouldCreateCycle { id: tag.id, parent };
        if parent == tag.id || tag.children.contains(&parent) {
            return Err(cycle);
        }

        self.require_parent(parent)?;

        // Descendant sets can be stale; the parent chain is authoritative.
        if self
            .repo
            .ancestors(parent, self.config.max_depth)?
            .iter()
            .any(|ancestor| ancestor.id == tag.id)
        {
            return Err(cycle);
        }
        Ok(())
    }

    // --- Integrity ---

    /// Compare every descendant set with the one implied by parent pointers.
    pub fn check_integrity(&self) -> Result<Vec<IntegrityViolation>> {
        let tags = self.repo.all()?;
        let (expected, cycles) = self.expected_descendants(&tags);

        let mut violations: Vec<_> = cycles
            .into_iter()
            .map(|id| IntegrityViolation::Cycle { id })
            .collect();

        let empty = BTreeSet::new();
        for tag in &tags {
            let want = expected.get(&tag.id).unwrap_or(&empty);
            for &descendant in want.difference(&tag.children) {
                violations.push(IntegrityViolation::MissingDescendant {
                    ancestor: tag.id,
                    descendant,
                });
            }
            for &id in tag.children.difference(want) {
                violations.push(IntegrityViolation::DanglingDescendant {
                    ancestor: tag.id,
                    id,
                });
            }
        }

        Ok(violations)
    }

    /// Recompute every descendant set from parent pointers, saving the tags
    /// that differ. Returns how many were rewritten.
    pub fn rebuild_descendants(&self) -> Result<usize> {
        let _lock = self.write_lock.lock();

        let tags = self.repo.all()?;
        let (expected, cycles) = self.expected_descendants(&tags);
        if let Some(&id) = cycles.first() {
            return Err(TagError::CycleDetected {
                id,
                depth: self.config.max_depth,
            });
        }

        let mut rewritten = 0;
        for mut tag in tags {
            let want = expected.get(&tag.id).cloned().unwrap_or_default();
            if tag.children != want {
                tag.children = want;
                self.repo.save(&tag)?;
                self.registry.notify_for_tag(&tag);
                rewritten += 1;
            }
        }

        debug!(rewritten, "descendant sets rebuilt");
        Ok(rewritten)
    }

    /// Descendant sets implied by parent pointers, plus tags stuck in cycles.
    fn expected_descendants(&self, tags: &[Tag]) -> (HashMap<TagId, BTreeSet<TagId>>, Vec<TagId>) {
        let by_id: HashMap<TagId, &Tag> = tags.iter().map(|t| (t.id, t)).collect();
        let mut expected: HashMap<TagId, BTreeSet<TagId>> = HashMap::new();
        let mut cycles = Vec::new();

        for tag in tags {
            let mut next = tag.parent;
            let mut depth = 0;
            while let Some(parent_id) = next {
                if depth >= self.config.max_depth {
                    cycles.push(tag.id);
                    break;
                }
                let Some(parent) = by_id.get(&parent_id) else {
                    break;
                };
                expected.entry(parent_id).or_default().insert(tag.id);
                next = parent.parent;
                depth += 1;
            }
        }

        (expected, cycles)
    }
}

/// Union of the scopes of `tags`.
fn tag_scopes(tags: &[Tag]) -> BTreeSet<ScopeId> {
    tags.iter()
        .flat_map(|tag| tag.scopes.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryTagRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn index() -> TagIndex<MemoryTagRepository> {
        TagIndex::new(Arc::new(MemoryTagRepository::new()), TagIndexConfig::default()).unwrap()
    }

    fn descendants(index: &TagIndex<MemoryTagRepository>, id: TagId) -> Vec<TagId> {
        index.get(id).unwrap().unwrap().children.into_iter().collect()
    }

    #[test]
    fn test_create_requires_parent() {
        let index = index();
        let result = index.create(TagInput::new("orphan").with_parent(TagId(42)));
        assert!(matches!(result, Err(TagError::ParentNotFound(TagId(42)))));
    }

    #[test]
    fn test_create_without_validation_tolerates_missing_parent() {
        let index = TagIndex::new(
            Arc::new(MemoryTagRepository::new()),
            TagIndexConfig {
                validate_parents: false,
                ..Default::default()
            },
        )
        .unwrap();

        let tag = index.create(TagInput::new("detached").with_parent(TagId(42))).unwrap();
        assert_eq!(tag.parent, Some(TagId(42)));
    }

    #[test]
    fn test_update_keeps_descendant_set() {
        let index = index();
        let root = index.create(TagInput::new("root")).unwrap();
        let child = index.create(TagInput::new("child").with_parent(root.id)).unwrap();

        let mut edit = index.get(root.id).unwrap().unwrap();
        edit.name = "renamed".into();
        edit.children.clear();
        let saved = index.update(edit).unwrap();

        assert_eq!(saved.name, "renamed");
        assert_eq!(descendants(&index, root.id), vec![child.id]);
    }

    #[test]
    fn test_update_moves_subtree() {
        let index = index();
        let a = index.create(TagInput::new("a")).unwrap();
        let b = index.create(TagInput::new("b")).unwrap();
        let c = index.create(TagInput::new("c").with_parent(a.id)).unwrap();
        let d = index.create(TagInput::new("d").with_parent(c.id)).unwrap();

        let mut moved = index.get(c.id).unwrap().unwrap();
        moved.parent = Some(b.id);
        index.update(moved).unwrap();

        assert!(descendants(&index, a.id).is_empty());
        assert_eq!(descendants(&index, b.id), vec![c.id, d.id]);
        assert!(index.check_integrity().unwrap().is_empty());
    }

    #[test]
    fn test_update_rejects_cycle() {
        let index = index();
        let a = index.create(TagInput::new("a")).unwrap();
        let b = index.create(TagInput::new("b").with_parent(a.id)).unwrap();

        let mut edit = index.get(a.id).unwrap().unwrap();
        edit.parent = Some(b.id);
        let result = index.update(edit);
        assert!(matches!(result, Err(TagError::WouldCreateCycle { .. })));

        let mut edit = index.get(a.id).unwrap().unwrap();
        edit.parent = Some(a.id);
        assert!(matches!(index.update(edit), Err(TagError::WouldCreateCycle { .. })));
    }

    #[test]
    fn test_update_unknown_tag() {
        let index = index();
        let ghost = Tag::from_input(TagId(9), TagInput::new("ghost"));
        assert!(matches!(index.update(ghost), Err(TagError::TagNotFound(TagId(9)))));
    }

    #[test]
    fn test_delete_notifies_descendant_scopes() {
        let index = index();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        index
            .register_projection("storeB", move || {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let root = index.create(TagInput::new("root").in_scope("storeA")).unwrap();
        index
            .create(TagInput::new("leaf").with_parent(root.id).in_scope("storeB"))
            .unwrap();
        index.registry().flush();
        let before = hits.load(Ordering::SeqCst);

        index.delete(root.id).unwrap();
        index.registry().flush();
        assert_eq!(hits.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_create_notifies_ancestor_scopes() {
        let index = index();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        index
            .register_projection("storeA", move || {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let root = index.create(TagInput::new("root").in_scope("storeA")).unwrap();
        index.registry().flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The child lives elsewhere but grows storeA's root
        let child = index
            .create(TagInput::new("child").with_parent(root.id).in_scope("storeB"))
            .unwrap();
        index.registry().flush();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        index.delete(child.id).unwrap();
        index.registry().flush();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_move_notifies_old_and_new_ancestor_scopes() {
        let index = index();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for scope in ["storeA", "storeB"] {
            let s = Arc::clone(&seen);
            index
                .register_projection(scope, move || {
                    s.lock().push(scope);
                    Ok(())
                })
                .unwrap();
        }

        let a = index.create(TagInput::new("a").in_scope("storeA")).unwrap();
        let b = index.create(TagInput::new("b").in_scope("storeB")).unwrap();
        let leaf = index.create(TagInput::new("leaf").with_parent(a.id)).unwrap();
        index.registry().flush();
        seen.lock().clear();

        let mut moved = index.get(leaf.id).unwrap().unwrap();
        moved.parent = Some(b.id);
        index.update(moved).unwrap();
        index.registry().flush();

        let mut scopes = seen.lock().clone();
        scopes.sort();
        assert_eq!(scopes, vec!["storeA", "storeB"]);
    }

    #[test]
    fn test_duplicate_url_rejected() {
        let index = index();
        let shirts = index.create(TagInput::new("Shirts").with_url("shirts")).unwrap();
        let result = index.create(TagInput::new("Shirts again").with_url("shirts"));
        assert!(matches!(result, Err(TagError::DuplicateUrl(url)) if url == "shirts"));

        let polos = index.create(TagInput::new("Polos").with_url("polos")).unwrap();
        let mut edit = polos.clone();
        edit.url = Some("shirts".into());
        assert!(matches!(index.update(edit), Err(TagError::DuplicateUrl(_))));

        // Keeping its own url is fine
        let mut edit = shirts;
        edit.name = "Tees".into();
        assert_eq!(index.update(edit).unwrap().url.as_deref(), Some("shirts"));
    }

    #[test]
    fn test_integrity_and_rebuild() {
        let repo = Arc::new(MemoryTagRepository::new());
        let index = TagIndex::new(Arc::clone(&repo), TagIndexConfig::default()).unwrap();
        let a = index.create(TagInput::new("a")).unwrap();
        let b = index.create(TagInput::new("b").with_parent(a.id)).unwrap();

        // Corrupt: drop b from a's set, add a stray id
        let mut broken = repo.find_by_id(a.id).unwrap().unwrap();
        broken.children = [TagId(77)].into_iter().collect();
        repo.save(&broken).unwrap();

        let violations = index.check_integrity().unwrap();
        assert!(violations.contains(&IntegrityViolation::MissingDescendant {
            ancestor: a.id,
            descendant: b.id
        }));
        assert!(violations.contains(&IntegrityViolation::DanglingDescendant {
            ancestor: a.id,
            id: TagId(77)
        }));

        assert_eq!(index.rebuild_descendants().unwrap(), 1);
        assert!(index.check_integrity().unwrap().is_empty());
    }

    #[test]
    fn test_register_projection_after_shutdown() {
        let index = index();
        index.registry().shutdown().unwrap();
        let result = index.register_projection("s", || Ok(()));
        assert!(matches!(result, Err(TagError::RegistryClosed)));
    }
}
