//! Scope-keyed invalidation registry with fire-and-forget dispatch.

use crate::error::{Result, TagError};
use crate::types::{ScopeId, Tag};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::types::{
    Dispatch, RecomputeFn, Registration, RegistryConfig, RegistryStats, SubscriptionId,
};

/// Shared between the registry and its workers.
#[derive(Default)]
struct DispatchState {
    /// Notifications sent but not yet fully run.
    pending: Mutex<u64>,
    idle: Condvar,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl DispatchState {
    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Maps scopes to recompute callbacks and runs them when a scope changes.
///
/// `notify` never waits for callbacks and never sees their failures: each
/// notification is queued to a worker thread, which runs the scope's
/// callbacks in registration order, logging and dropping any error or panic.
pub struct InvalidationRegistry {
    /// Callbacks by scope, in registration order.
    scopes: RwLock<HashMap<ScopeId, Vec<Registration>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Queue to the workers. `None` once shut down.
    sender: Mutex<Option<Sender<Dispatch>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<DispatchState>,
}

impl InvalidationRegistry {
    /// Create a registry with one dispatch worker.
    pub fn new() -> Result<Self> {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry and start its workers.
    pub fn with_config(config: RegistryConfig) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let state = Arc::new(DispatchState::default());

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for n in 0..config.workers.max(1) {
            let receiver = receiver.clone();
            let state = Arc::clone(&state);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, n))
                .spawn(move || run_worker(receiver, state))?;
            workers.push(handle);
        }

        Ok(Self {
            scopes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            state,
        })
    }

    /// Register `callback` under `scope`.
    ///
    /// Subscriptions accumulate in registration order; the same callback
    /// registered twice runs twice.
    pub fn subscribe<F>(&self, scope: impl Into<ScopeId>, callback: F) -> SubscriptionId
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe_arc(scope, Arc::new(callback))
    }

    /// Register an already shared callback.
    pub fn subscribe_arc(&self, scope: impl Into<ScopeId>, callback: RecomputeFn) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let scope = scope.into();

        debug!(scope = %scope, subscription = id.0, "subscribed");
        self.scopes
            .write()
            .entry(scope)
            .or_default()
            .push(Registration { id, callback });

        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut scopes = self.scopes.write();
        let mut found = false;
        scopes.retain(|_, registrations| {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            found |= registrations.len() != before;
            !registrations.is_empty()
        });
        found
    }

    /// Queue every callback of `scope` for execution.
    ///
    /// Returns the number of callbacks dispatched. Never blocks on or fails
    /// because of a callback.
    pub fn notify(&self, scope: &ScopeId) -> usize {
        let callbacks = match self.scopes.read().get(scope) {
            Some(registrations) if !registrations.is_empty() => registrations.clone(),
            _ => return 0,
        };
        let count = callbacks.len();

        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            warn!(scope = %scope, "notify after shutdown dropped");
            return 0;
        };

        *self.state.pending.lock() += 1;
        let dispatch = Dispatch {
            scope: scope.clone(),
            callbacks,
        };
        if sender.send(dispatch).is_err() {
            self.state.finish_one();
            warn!(scope = %scope, "dispatch queue closed");
            return 0;
        }

        self.state
            .dispatched
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Notify every scope the tag belongs to. Returns callbacks dispatched.
    pub fn notify_for_tag(&self, tag: &Tag) -> usize {
        tag.scopes.iter().map(|scope| self.notify(scope)).sum()
    }

    /// Block until every queued notification has run.
    pub fn flush(&self) {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.idle.wait(&mut pending);
        }
    }

    /// Like [`flush`](Self::flush) with a deadline. Returns false on timeout.
    pub fn flush_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            if self.state.idle.wait_for(&mut pending, timeout).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    /// Stop accepting notifications, drain the queue and join the workers.
    ///
    /// Called from a callback, the calling worker is left to finish the
    /// queue on its own instead of being joined.
    pub fn shutdown(&self) -> Result<()> {
        self.sender.lock().take();

        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let mut panicked = false;
        for worker in workers {
            if worker.thread().id() == current {
                debug!("shutdown from dispatch worker, not joining itself");
                continue;
            }
            panicked |= worker.join().is_err();
        }

        if panicked {
            return Err(TagError::Callback("dispatch worker panicked".into()));
        }
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Number of live subscriptions across all scopes.
    pub fn subscription_count(&self) -> usize {
        self.scopes.read().values().map(Vec::len).sum()
    }

    /// Number of scopes with at least one subscription.
    pub fn scope_count(&self) -> usize {
        self.scopes.read().len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            dispatched: self.state.dispatched.load(Ordering::Relaxed),
            completed: self.state.completed.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for InvalidationRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn run_worker(receiver: Receiver<Dispatch>, state: Arc<DispatchState>) {
    while let Ok(dispatch) = receiver.recv() {
        for registration in &dispatch.callbacks {
            run_callback(&dispatch.scope, registration, &state);
        }
        state.finish_one();
    }
}

/// Run one callback, isolating errors and panics.
fn run_callback(scope: &ScopeId, registration: &Registration, state: &DispatchState) {
    let callback = &registration.callback;
    match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
        Ok(Ok(())) => {
            state.completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            state.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                scope = %scope,
                subscription = registration.id.0,
                error = %e,
                "recompute callback failed"
            );
        }
        Err(_) => {
            state.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                scope = %scope,
                subscription = registration.id.0,
                "recompute callback panicked"
            );
        }
    }
}
