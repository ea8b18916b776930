//! Core types for the tag index.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a tag.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagId(pub u64);

impl fmt::Debug for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagId({})", self.0)
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owning entity a tag applies to (e.g. a store). Used as the invalidation key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Self {
        ScopeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopeId({})", self.0)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeId {
    fn from(s: &str) -> Self {
        ScopeId(s.to_string())
    }
}

impl From<String> for ScopeId {
    fn from(s: String) -> Self {
        ScopeId(s)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A tag in the forest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Unique identifier (assigned by the index).
    pub id: TagId,

    /// Parent tag, `None` for a root.
    pub parent: Option<TagId>,

    /// Every transitive descendant of this tag, not only direct children.
    #[serde(default)]
    pub children: BTreeSet<TagId>,

    /// Owning entities this tag applies to.
    #[serde(default)]
    pub scopes: BTreeSet<ScopeId>,

    /// Display name.
    pub name: String,

    /// Optional unique slug.
    #[serde(default)]
    pub url: Option<String>,

    /// Sort key within a scope listing.
    #[serde(default)]
    pub order: i64,

    /// Disabled tags stay in the tree but drop out of scope listings.
    pub enabled: bool,

    pub created: Timestamp,
    pub updated: Timestamp,
}

impl Tag {
    /// Build a tag from input with an assigned id.
    pub fn from_input(id: TagId, input: TagInput) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            parent: input.parent,
            children: BTreeSet::new(),
            scopes: input.scopes,
            name: input.name,
            url: input.url,
            order: input.order,
            enabled: input.enabled,
            created: now,
            updated: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// This tag's id together with all its descendants.
    pub fn subtree_ids(&self) -> BTreeSet<TagId> {
        let mut ids = self.children.clone();
        ids.insert(self.id);
        ids
    }
}

/// Input for creating a new tag (before an id is assigned).
#[derive(Clone, Debug)]
pub struct TagInput {
    pub name: String,
    pub parent: Option<TagId>,
    pub scopes: BTreeSet<ScopeId>,
    pub url: Option<String>,
    pub order: i64,
    pub enabled: bool,
}

impl TagInput {
    /// A new enabled root tag with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            scopes: BTreeSet::new(),
            url: None,
            order: 0,
            enabled: true,
        }
    }

    /// Attach under a parent.
    pub fn with_parent(mut self, parent: TagId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Add an owning scope.
    pub fn in_scope(mut self, scope: impl Into<ScopeId>) -> Self {
        self.scopes.insert(scope.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Filter for scope queries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagFilter {
    /// Only return enabled tags.
    pub enabled_only: bool,
}

impl TagFilter {
    /// Every tag in the scope.
    pub fn all() -> Self {
        Self::default()
    }

    /// Enabled tags only.
    pub fn enabled() -> Self {
        Self { enabled_only: true }
    }

    pub fn matches(&self, tag: &Tag) -> bool {
        !self.enabled_only || tag.enabled
    }
}
