//! Reentrant async gate.
//!
//! A plain async mutex deadlocks when the task holding it tries to acquire
//! it again, which is exactly what happens when a cancellation handle is
//! invoked from inside a "cancel everything under this id" sweep. The gate
//! records the gates held by the current task in a task-local, so a nested
//! acquisition on the same logical call path runs straight through.
//!
//! Ownership follows the task, not the thread, so it stays correct on
//! work-stealing runtimes. Tasks spawned while the gate is held do not
//! inherit it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

tokio::task_local! {
    /// Ids of the gates held by the current task, outermost first.
    static HELD_GATES: Vec<u64>;
}

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ReentrantGate {
    id: u64,
    mutex: Mutex<()>,
}

impl ReentrantGate {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            mutex: Mutex::new(()),
        }
    }

    /// Whether the current task already holds this gate.
    pub(crate) fn is_held(&self) -> bool {
        HELD_GATES
            .try_with(|held| held.contains(&self.id))
            .unwrap_or(false)
    }

    /// Run `fut` while holding the gate.
    ///
    /// If the current task already holds it, `fut` runs directly.
    pub(crate) async fn with_lock<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        if self.is_held() {
            return fut.await;
        }

        let _guard = self.mutex.lock().await;
        let mut held = HELD_GATES.try_with(Clone::clone).unwrap_or_default();
        held.push(self.id);
        HELD_GATES.scope(held, fut).await
    }
}

impl std::fmt::Debug for ReentrantGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantGate")
            .field("id", &self.id)
            .field("held_here", &self.is_held())
            .finish()
    }
}
