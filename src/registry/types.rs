//! Invalidation registry types.

use crate::error::Result;
use crate::types::ScopeId;
use std::sync::Arc;

/// A zero-argument recompute callback.
///
/// May run concurrently with itself when notifications for its scope
/// overlap, so it should only refresh a cache.
pub type RecomputeFn = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Configuration for the invalidation registry.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Dispatch threads. Callbacks of one notification always run in
    /// registration order on a single thread; more workers only let
    /// separate notifications proceed in parallel.
    /// Default: 1
    pub workers: usize,

    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            thread_name: "tag-invalidate".to_string(),
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Counters for dispatched callbacks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Callbacks handed to a worker.
    pub dispatched: u64,
    /// Callbacks that returned `Ok`.
    pub completed: u64,
    /// Callbacks that returned an error or panicked.
    pub failed: u64,
}

/// A callback registered under a scope.
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) id: SubscriptionId,
    pub(crate) callback: RecomputeFn,
}

/// One notification: the callbacks of a scope, captured at notify time.
pub(crate) struct Dispatch {
    pub(crate) scope: ScopeId,
    pub(crate) callbacks: Vec<Registration>,
}
