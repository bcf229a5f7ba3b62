//! Owner-context confinement checks.
//!
//! A store is not meant to be driven from several threads at once: every
//! `send`, `scope` and effect completion is expected on the thread that
//! created it. When enabled, the guard turns a violation into an immediate
//! panic naming the offending operation. Disabled guards check nothing.

use std::fmt::Debug;
use std::thread::{self, ThreadId};

/// The operation being checked, used to build the panic message.
pub(crate) enum Operation<'a> {
    Send(&'a dyn Debug),
    Scope,
    EffectCompletion(&'a dyn Debug),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct OwnerGuard {
    owner: Option<ThreadId>,
}

impl OwnerGuard {
    /// A guard bound to the current thread, or a no-op guard.
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            owner: enabled.then(|| thread::current().id()),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.owner.is_some()
    }

    /// Panic if called off the owning thread.
    pub(crate) fn check(&self, operation: Operation<'_>) {
        let Some(owner) = self.owner else {
            return;
        };
        let current = thread::current().id();
        if current != owner {
            panic!("{}", violation_message(operation, owner, current));
        }
    }
}

const NOT_THREAD_SAFE: &str = "A store is confined to the thread that created it: every interaction \
with it, its scoped stores included, must happen on that thread. Build the store without owner \
checks to opt out.";

fn violation_message(operation: Operation<'_>, owner: ThreadId, current: ThreadId) -> String {
    let what = match operation {
        Operation::Send(action) => format!("`send` called off the owning thread with {action:?}"),
        Operation::Scope => "`scope` called off the owning thread".to_string(),
        Operation::EffectCompletion(action) => format!(
            "an effect completed off the owning thread; it was returned for {action:?}. \
             Run effects on a current-thread runtime or a LocalSet bound to the owner"
        ),
    };
    format!("{what} (owner {owner:?}, current {current:?}).\n\n{NOT_THREAD_SAFE}")
}
