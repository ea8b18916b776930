//! # Tag Forest
//!
//! A forest of tags where every tag carries the denormalized set of all of
//! its descendants, kept correct as tags are created, moved and deleted.
//!
//! ## Core Concepts
//!
//! - **Tree maintenance**: a new tag's id is added to every ancestor
//! - **Subtree deletion**: deleting a tag deletes everything below it and
//!   prunes the deleted ids from the surviving ancestors
//! - **Invalidation**: per-scope recompute callbacks, dispatched
//!   fire-and-forget after every successful mutation
//! - **Repositories**: in-memory or journaled on disk, with atomic
//!   descendant-set updates
//!
//! ## Example
//!
//! ```ignore
//! use tag_forest::{MemoryTagRepository, TagIndex, TagIndexConfig, TagInput};
//! use std::sync::Arc;
//!
//! let index = TagIndex::new(Arc::new(MemoryTagRepository::new()), TagIndexConfig::default())?;
//!
//! index.register_projection("storeA", || {
//!     // rebuild the cached listing for storeA
//!     Ok(())
//! })?;
//!
//! let clothing = index.create(TagInput::new("Clothing").in_scope("storeA"))?;
//! let shirts = index.create(TagInput::new("Shirts").with_parent(clothing.id))?;
//!
//! assert!(index.get(clothing.id)?.unwrap().children.contains(&shirts.id));
//! ```

pub mod error;
pub mod events;
pub mod index;
pub mod projection;
pub mod registry;
pub mod repository;
pub mod tree;
pub mod types;

// Re-exports
pub use error::{Result, TagError};
pub use events::TagEvent;
pub use index::{IntegrityViolation, TagIndex, TagIndexConfig};
pub use projection::{ProjectionCache, ScopeSnapshot, ScopeTag};
pub use registry::{InvalidationRegistry, RecomputeFn, RegistryConfig, RegistryStats, SubscriptionId};
pub use repository::{
    FileRepositoryConfig, FileTagRepository, MemoryTagRepository, TagRepository, TagTable,
};
pub use tree::{RemovedSubtree, SubtreeDeleter, TreeMaintainer, DEFAULT_MAX_DEPTH};
pub use types::{ScopeId, Tag, TagFilter, TagId, TagInput, Timestamp};
