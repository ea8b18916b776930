//! Cached per-scope tag listings.
//!
//! A [`ScopeSnapshot`] is the flattened view of one scope's enabled tags:
//! every tag sorted by `order`, each with its direct children, the root
//! tags, and the materialized set of every tag id that applies to the scope.
//! [`ProjectionCache`] keeps the latest snapshot per tracked scope and
//! refreshes it through the invalidation registry.

use crate::error::{Result, TagError};
use crate::registry::{InvalidationRegistry, SubscriptionId};
use crate::repository::TagRepository;
use crate::types::{ScopeId, Tag, TagFilter, TagId, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// A tag as it appears in a scope listing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScopeTag {
    #[serde(flatten)]
    pub tag: Tag,

    /// Direct children present in the same listing, in listing order.
    pub child_tags: Vec<TagId>,
}

/// Flattened view of the enabled tags in one scope.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScopeSnapshot {
    pub scope: ScopeId,

    /// False once the listing has been cleared.
    pub active: bool,

    /// Enabled tags in the scope, sorted by order then id.
    pub all_tags: Vec<ScopeTag>,

    /// Tags without a parent, in listing order.
    pub roots: Vec<TagId>,

    /// Every listed tag id together with all of its descendants.
    pub tag_ids: BTreeSet<TagId>,

    /// Bumped on every recompute of this scope.
    pub generation: u64,

    pub computed: Timestamp,
}

impl ScopeSnapshot {
    /// Build a snapshot from the scope's tags, already sorted for listing.
    pub fn compute(scope: ScopeId, tags: Vec<Tag>, generation: u64) -> Self {
        let mut child_tags: HashMap<TagId, Vec<TagId>> = HashMap::new();
        for tag in &tags {
            if let Some(parent) = tag.parent {
                child_tags.entry(parent).or_default().push(tag.id);
            }
        }

        let roots = tags
            .iter()
            .filter(|tag| tag.is_root())
            .map(|tag| tag.id)
            .collect();

        let tag_ids = tags.iter().flat_map(Tag::subtree_ids).collect();

        let all_tags = tags
            .into_iter()
            .map(|tag| ScopeTag {
                child_tags: child_tags.remove(&tag.id).unwrap_or_default(),
                tag,
            })
            .collect();

        Self {
            scope,
            active: true,
            all_tags,
            roots,
            tag_ids,
            generation,
            computed: Timestamp::now(),
        }
    }

    /// Look up a listed tag.
    pub fn get(&self, id: TagId) -> Option<&ScopeTag> {
        self.all_tags.iter().find(|entry| entry.tag.id == id)
    }

    /// Whether `id` applies to this scope (listed or below a listed tag).
    pub fn applies(&self, id: TagId) -> bool {
        self.tag_ids.contains(&id)
    }

    /// JSON form of the listing.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Snapshots plus the per-scope gates that order their recomputes.
#[derive(Default)]
struct Snapshots {
    current: RwLock<HashMap<ScopeId, Arc<ScopeSnapshot>>>,
    /// Held from the repository read until the snapshot is stored, so an
    /// older read can never replace a newer one.
    gates: Mutex<HashMap<ScopeId, Arc<Mutex<()>>>>,
}

impl Snapshots {
    fn gate(&self, scope: &ScopeId) -> Arc<Mutex<()>> {
        Arc::clone(self.gates.lock().entry(scope.clone()).or_default())
    }
}

/// Latest [`ScopeSnapshot`] per tracked scope.
pub struct ProjectionCache<R> {
    repo: Arc<R>,
    registry: Arc<InvalidationRegistry>,
    snapshots: Arc<Snapshots>,
}

impl<R: TagRepository + 'static> ProjectionCache<R> {
    pub fn new(repo: Arc<R>, registry: Arc<InvalidationRegistry>) -> Self {
        Self {
            repo,
            registry,
            snapshots: Arc::new(Snapshots::default()),
        }
    }

    /// Compute the scope's snapshot now and keep it fresh on every
    /// notification for the scope.
    pub fn track(&self, scope: impl Into<ScopeId>) -> Result<SubscriptionId> {
        if self.registry.is_shut_down() {
            return Err(TagError::RegistryClosed);
        }
        let scope = scope.into();

        recompute(&*self.repo, &self.snapshots, &scope)?;

        let repo = Arc::clone(&self.repo);
        let snapshots = Arc::clone(&self.snapshots);
        let key = scope.clone();
        let id = self
            .registry
            .subscribe(scope, move || recompute(&*repo, &snapshots, &key).map(|_| ()));

        Ok(id)
    }

    /// Recompute a scope's snapshot immediately.
    pub fn refresh(&self, scope: &ScopeId) -> Result<Arc<ScopeSnapshot>> {
        recompute(&*self.repo, &self.snapshots, scope)
    }

    /// Current snapshot for `scope`, if tracked.
    pub fn get(&self, scope: &ScopeId) -> Option<Arc<ScopeSnapshot>> {
        self.snapshots.current.read().get(scope).cloned()
    }

    /// Empty the child lists of a scope's snapshot and mark it inactive.
    ///
    /// The next notification for the scope recomputes it.
    pub fn clear(&self, scope: &ScopeId) -> bool {
        let mut snapshots = self.snapshots.current.write();
        let Some(current) = snapshots.get(scope) else {
            return false;
        };

        let mut cleared = (**current).clone();
        cleared.active = false;
        for entry in &mut cleared.all_tags {
            entry.child_tags.clear();
        }
        snapshots.insert(scope.clone(), Arc::new(cleared));
        true
    }

    /// Scopes with a snapshot.
    pub fn scopes(&self) -> Vec<ScopeId> {
        let mut scopes: Vec<_> = self.snapshots.current.read().keys().cloned().collect();
        scopes.sort();
        scopes
    }
}

fn recompute<R: TagRepository>(
    repo: &R,
    snapshots: &Snapshots,
    scope: &ScopeId,
) -> Result<Arc<ScopeSnapshot>> {
    let gate = snapshots.gate(scope);
    let _gate = gate.lock();

    let tags = repo.find_by_scope(scope, &TagFilter::enabled())?;

    let mut snapshots = snapshots.current.write();
    let generation = snapshots.get(scope).map_or(1, |s| s.generation + 1);
    let snapshot = Arc::new(ScopeSnapshot::compute(scope.clone(), tags, generation));
    snapshots.insert(scope.clone(), Arc::clone(&snapshot));

    debug!(
        scope = %scope,
        tags = snapshot.all_tags.len(),
        generation,
        "scope snapshot recomputed"
    );
    Ok(snapshot)
}
