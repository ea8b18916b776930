//! Error handling and edge case tests.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tag_forest::{
    FileRepositoryConfig, FileTagRepository, InvalidationRegistry, MemoryTagRepository, ScopeId,
    SubtreeDeleter, Tag, TagError, TagEvent, TagFilter, TagId, TagIndex, TagIndexConfig,
    TagInput, TagRepository, TreeMaintainer,
};
use tempfile::TempDir;

/// Memory repository that fails writes to selected tags.
#[derive(Default)]
struct FlakyRepository {
    inner: MemoryTagRepository,
    fail_writes: Mutex<HashSet<TagId>>,
    fail_deletes: Mutex<HashSet<TagId>>,
}

impl FlakyRepository {
    fn fail_writes_to(&self, id: TagId) {
        self.fail_writes.lock().insert(id);
    }

    fn fail_deletes_of(&self, id: TagId) {
        self.fail_deletes.lock().insert(id);
    }

    fn heal(&self) {
        self.fail_writes.lock().clear();
        self.fail_deletes.lock().clear();
    }

    fn check_write(&self, id: TagId) -> tag_forest::Result<()> {
        if self.fail_writes.lock().contains(&id) {
            return Err(TagError::Repository(format!("write to {} refused", id)));
        }
        Ok(())
    }
}

impl TagRepository for FlakyRepository {
    fn find_by_id(&self, id: TagId) -> tag_forest::Result<Option<Tag>> {
        self.inner.find_by_id(id)
    }

    fn find_by_parent(&self, parent: TagId) -> tag_forest::Result<Vec<Tag>> {
        self.inner.find_by_parent(parent)
    }

    fn find_by_scope(&self, scope: &ScopeId, filter: &TagFilter) -> tag_forest::Result<Vec<Tag>> {
        self.inner.find_by_scope(scope, filter)
    }

    fn save(&self, tag: &Tag) -> tag_forest::Result<()> {
        self.check_write(tag.id)?;
        self.inner.save(tag)
    }

    fn delete(&self, id: TagId) -> tag_forest::Result<bool> {
        if self.fail_deletes.lock().contains(&id) {
            return Err(TagError::Repository(format!("delete of {} refused", id)));
        }
        self.inner.delete(id)
    }

    fn all(&self) -> tag_forest::Result<Vec<Tag>> {
        self.inner.all()
    }

    fn next_id(&self) -> tag_forest::Result<TagId> {
        self.inner.next_id()
    }

    fn add_descendants(&self, id: TagId, ids: &[TagId]) -> tag_forest::Result<Option<Tag>> {
        self.check_write(id)?;
        self.inner.add_descendants(id, ids)
    }

    fn remove_descendants(
        &self,
        id: TagId,
        ids: &BTreeSet<TagId>,
    ) -> tag_forest::Result<Option<Tag>> {
        self.check_write(id)?;
        self.inner.remove_descendants(id, ids)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn flaky_index() -> (Arc<FlakyRepository>, TagIndex<FlakyRepository>) {
    init_tracing();
    let repo = Arc::new(FlakyRepository::default());
    let index = TagIndex::new(Arc::clone(&repo), TagIndexConfig::default()).unwrap();
    (repo, index)
}

fn chain(index: &TagIndex<FlakyRepository>, depth: usize) -> Vec<Tag> {
    let mut tags: Vec<Tag> = Vec::new();
    for n in 0..depth {
        let mut input = TagInput::new(format!("level{}", n)).in_scope("storeA");
        if let Some(parent) = tags.last() {
            input = input.with_parent(parent.id);
        }
        tags.push(index.create(input).unwrap());
    }
    tags
}

// --- Repository failures ---

#[test]
fn test_create_walk_failure_is_partial_and_retryable() {
    let (repo, index) = flaky_index();
    let tags = chain(&index, 4);
    let (a, b, c, d) = (&tags[0], &tags[1], &tags[2], &tags[3]);

    // New leaf under d; the walk fails at b
    let leaf = Tag::from_input(TagId(100), TagInput::new("leaf").with_parent(d.id));
    repo.save(&leaf).unwrap();
    repo.fail_writes_to(b.id);

    let result = index.handle(TagEvent::Created { tag: leaf.clone() });
    assert!(matches!(result, Err(TagError::Repository(_))));

    // Nearer ancestors are done, farther ones untouched
    assert!(repo.find_by_id(d.id).unwrap().unwrap().children.contains(&leaf.id));
    assert!(repo.find_by_id(c.id).unwrap().unwrap().children.contains(&leaf.id));
    assert!(!repo.find_by_id(b.id).unwrap().unwrap().children.contains(&leaf.id));
    assert!(!repo.find_by_id(a.id).unwrap().unwrap().children.contains(&leaf.id));

    // Retrying the whole walk converges
    repo.heal();
    index.handle(TagEvent::Created { tag: leaf.clone() }).unwrap();
    assert!(repo.find_by_id(a.id).unwrap().unwrap().children.contains(&leaf.id));
    assert!(index.check_integrity().unwrap().is_empty());
}

#[test]
fn test_failed_maintenance_skips_notification() {
    let (repo, index) = flaky_index();
    let root = index.create(TagInput::new("root")).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    index
        .register_projection("storeA", move || {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    repo.fail_writes_to(root.id);
    let result = index.create(TagInput::new("child").with_parent(root.id).in_scope("storeA"));
    assert!(matches!(result, Err(TagError::Repository(_))));
    assert!(result.unwrap_err().is_structural());

    index.registry().flush();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_descendant_delete_failure_aborts() {
    let (repo, index) = flaky_index();
    let tags = chain(&index, 3);
    let (a, b, c) = (&tags[0], &tags[1], &tags[2]);

    repo.fail_deletes_of(c.id);
    let result = index.delete(b.id);
    assert!(matches!(result, Err(TagError::Repository(_))));

    // Nothing pruned yet: the ancestor still lists the subtree
    assert!(repo.find_by_id(b.id).unwrap().is_some());
    assert_eq!(
        repo.find_by_id(a.id).unwrap().unwrap().children,
        [b.id, c.id].into_iter().collect::<BTreeSet<_>>()
    );

    repo.heal();
    assert_eq!(index.delete(b.id).unwrap(), vec![b.id, c.id]);
    assert!(repo.find_by_id(a.id).unwrap().unwrap().children.is_empty());
}

#[test]
fn test_prune_failure_leaves_root_record() {
    let (repo, index) = flaky_index();
    let tags = chain(&index, 3);
    let (a, b) = (&tags[0], &tags[1]);

    repo.fail_writes_to(a.id);
    assert!(matches!(index.delete(b.id), Err(TagError::Repository(_))));

    // Root record removal comes last, so it is still there to retry from
    assert!(repo.find_by_id(b.id).unwrap().is_some());
    repo.heal();
    index.delete(b.id).unwrap();
    assert!(index.check_integrity().unwrap().is_empty());
}

// --- Cycles ---

#[test]
fn test_cycle_in_stored_data_is_bounded() {
    let repo = Arc::new(MemoryTagRepository::new());
    let x = Tag::from_input(TagId(1), TagInput::new("x").with_parent(TagId(2)));
    let y = Tag::from_input(TagId(2), TagInput::new("y").with_parent(TagId(1)));
    repo.save(&x).unwrap();
    repo.save(&y).unwrap();

    let maintainer = TreeMaintainer::with_max_depth(Arc::clone(&repo), 16);
    assert!(matches!(
        maintainer.on_create(&x),
        Err(TagError::CycleDetected { .. })
    ));

    let index = TagIndex::new(
        Arc::clone(&repo),
        TagIndexConfig {
            max_depth: 16,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(index.ancestors(TagId(1)).is_err());
    assert!(matches!(
        index.rebuild_descendants(),
        Err(TagError::CycleDetected { .. })
    ));
    assert!(!index.check_integrity().unwrap().is_empty());
}

#[test]
fn test_cycle_in_subtree_delete_is_bounded() {
    let repo = Arc::new(MemoryTagRepository::new());
    repo.save(&Tag::from_input(TagId(1), TagInput::new("x").with_parent(TagId(2))))
        .unwrap();
    repo.save(&Tag::from_input(TagId(2), TagInput::new("y").with_parent(TagId(1))))
        .unwrap();

    let maintainer = TreeMaintainer::with_max_depth(Arc::clone(&repo), 8);
    let deleter = SubtreeDeleter::new(Arc::clone(&repo), maintainer);
    let x = repo.find_by_id(TagId(1)).unwrap().unwrap();

    // Descendants are removed after their own subtree, so the loop never empties
    assert!(matches!(
        deleter.delete_subtree(&x),
        Err(TagError::CycleDetected { .. })
    ));
    assert_eq!(repo.len(), 2);
}

#[test]
fn test_update_rejects_move_under_descendant() {
    let index = TagIndex::new(Arc::new(MemoryTagRepository::new()), TagIndexConfig::default())
        .unwrap();
    let a = index.create(TagInput::new("a")).unwrap();
    let b = index.create(TagInput::new("b").with_parent(a.id)).unwrap();
    let c = index.create(TagInput::new("c").with_parent(b.id)).unwrap();

    let mut edit = index.get(a.id).unwrap().unwrap();
    edit.parent = Some(c.id);
    assert!(matches!(
        index.update(edit),
        Err(TagError::WouldCreateCycle { id, parent }) if id == a.id && parent == c.id
    ));
    assert!(index.get(a.id).unwrap().unwrap().parent.is_none());
}

#[test]
fn test_update_rejects_missing_parent() {
    let index = TagIndex::new(Arc::new(MemoryTagRepository::new()), TagIndexConfig::default())
        .unwrap();
    let a = index.create(TagInput::new("a")).unwrap();

    let mut edit = a;
    edit.parent = Some(TagId(404));
    assert!(matches!(
        index.update(edit),
        Err(TagError::ParentNotFound(TagId(404)))
    ));
}

// --- Callbacks ---

#[test]
fn test_callback_failures_never_reach_mutation() {
    init_tracing();
    let index = TagIndex::new(Arc::new(MemoryTagRepository::new()), TagIndexConfig::default())
        .unwrap();
    let after = Arc::new(AtomicUsize::new(0));

    index
        .register_projection("storeA", || Err(TagError::Callback("listing failed".into())))
        .unwrap();
    index
        .register_projection("storeA", || panic!("listing exploded"))
        .unwrap();
    let a = Arc::clone(&after);
    index
        .register_projection("storeA", move || {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    index.create(TagInput::new("t").in_scope("storeA")).unwrap();
    index.registry().flush();

    assert_eq!(after.load(Ordering::SeqCst), 1);
    let stats = index.registry().stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.completed, 1);
}

#[test]
fn test_notify_after_shutdown_does_not_fail_mutation() {
    let registry = Arc::new(InvalidationRegistry::new().unwrap());
    let index = TagIndex::with_registry(
        Arc::new(MemoryTagRepository::new()),
        Arc::clone(&registry),
        TagIndexConfig::default(),
    );
    registry.subscribe("storeA", || Ok(()));
    registry.shutdown().unwrap();

    index.create(TagInput::new("t").in_scope("storeA")).unwrap();
    assert_eq!(registry.stats().dispatched, 0);
}

// --- File repository ---

#[test]
fn test_second_open_is_locked() {
    let dir = TempDir::new().unwrap();
    let config = FileRepositoryConfig {
        path: dir.path().join("tags"),
        ..Default::default()
    };

    let _first = FileTagRepository::open_or_create(config.clone()).unwrap();
    assert!(matches!(
        FileTagRepository::open(config),
        Err(TagError::Locked)
    ));
}

#[test]
fn test_open_missing_without_create() {
    let dir = TempDir::new().unwrap();
    let config = FileRepositoryConfig {
        path: dir.path().join("absent"),
        create_if_missing: false,
        ..Default::default()
    };
    assert!(matches!(
        FileTagRepository::open_or_create(config),
        Err(TagError::NotInitialized)
    ));
}
