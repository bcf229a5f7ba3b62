//! Background task scopes.
//!
//! Every store owns a [`TaskScope`]: effect tasks and state subscriptions
//! are spawned into it, and tearing the scope down aborts all of them.
//! Scopes nest, so tearing down a root store's scope also stops the
//! subscriptions of every store scoped from it.
//!
//! Finished tasks remove themselves, so `active()` reflects live work only.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::error::ComposableError;

/// A cancellable group of background tasks.
#[derive(Clone)]
pub struct TaskScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    name: &'static str,
    runtime: Handle,
    tasks: DashMap<u64, AbortHandle>,
    next_id: AtomicU64,
    closed: AtomicBool,
    children: Mutex<Vec<Weak<ScopeInner>>>,
}

impl TaskScope {
    /// Create a scope that spawns onto `runtime`.
    pub fn new(name: &'static str, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name,
                runtime,
                tasks: DashMap::new(),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a scope torn down together with this one.
    ///
    /// A child of an already torn-down scope starts out torn down.
    pub fn child(&self, name: &'static str) -> Self {
        let child = Self::new(name, self.inner.runtime.clone());
        if self.is_closed() {
            child.cancel_all();
            return child;
        }
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        child
    }

    /// Spawn `fut` into this scope.
    pub fn spawn<F>(&self, fut: F) -> Result<(), ComposableError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(ComposableError::TornDown {
                scope: self.inner.name,
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let scope = Arc::downgrade(&self.inner);
        let handle = self.inner.runtime.spawn(async move {
            fut.await;
            if let Some(scope) = scope.upgrade() {
                scope.tasks.remove(&id);
            }
        });

        self.inner.tasks.insert(id, handle.abort_handle());
        // The task may have finished before it was recorded.
        if handle.is_finished() {
            self.inner.tasks.remove(&id);
        }
        trace!(scope = self.inner.name, task = id, "spawned task");
        Ok(())
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Whether `cancel_all` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Abort every task in this scope and its children. Idempotent.
    pub fn cancel_all(&self) {
        self.inner.cancel_all();
    }
}

impl ScopeInner {
    fn cancel_all(&self) {
        let was_closed = self.closed.swap(true, Ordering::AcqRel);

        let ids: Vec<u64> = self.tasks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.tasks.remove(&id) {
                handle.abort();
            }
        }

        let children: Vec<Weak<ScopeInner>> = std::mem::take(
            &mut *self
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel_all();
        }

        if !was_closed {
            debug!(scope = self.name, "task scope torn down");
        }
    }
}

impl std::fmt::Debug for TaskScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScope")
            .field("name", &self.inner.name)
            .field("active", &self.active())
            .field("closed", &self.is_closed())
            .finish()
    }
}
