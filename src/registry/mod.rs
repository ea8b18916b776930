//! Scope invalidation for cached tag projections.
//!
//! Downstream views (a store's tag listing, say) subscribe a recompute
//! callback under a scope key. Mutation hooks call `notify` for every scope
//! an affected tag belongs to, and the registry runs the callbacks on its
//! own worker threads:
//! - callbacks of one notification run in registration order
//! - a failing or panicking callback is logged and skipped
//! - `notify` never blocks on callbacks
//!
//! # Example
//!
//! ```ignore
//! let registry = InvalidationRegistry::new()?;
//!
//! registry.subscribe("storeA", move || {
//!     listing.refresh()?;
//!     Ok(())
//! });
//!
//! // After a tag in storeA changes
//! registry.notify(&ScopeId::from("storeA"));
//! ```

mod manager;
mod types;

pub use manager::InvalidationRegistry;
pub use types::{RecomputeFn, RegistryConfig, RegistryStats, SubscriptionId};
