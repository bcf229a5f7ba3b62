//! Error types and the effect failure policy.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses into a reducer.**
//!
//! - `anyhow` is internal transport (ergonomic inside effect bodies)
//! - [`EffectFailed`] is the only externalized failure, and only when the
//!   store is configured with [`EffectErrorPolicy::Feedback`]
//!
//! Library misuse that can be recovered from surfaces as
//! [`ComposableError`]. Broken invariants (owner confinement, optional
//! child state missing) panic instead; they are never recovered locally.
//!
//! # Feedback Example
//!
//! ```ignore
//! use composable::{EffectErrorPolicy, Store};
//!
//! let store = Store::builder(State::default(), reducer)
//!     .with_error_policy(EffectErrorPolicy::feedback(Action::EffectFailed))
//!     .build();
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Recoverable errors produced by the library.
#[derive(Debug, Error)]
pub enum ComposableError {
    /// A store was built outside of a tokio runtime and no handle was given.
    #[error("no tokio runtime available to run effects: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// Work was submitted to a task scope that has already been torn down.
    #[error("task scope '{scope}' has been torn down")]
    TornDown { scope: &'static str },

    /// A reducer builder was finished without any reducers.
    #[error("reducer builder has no reducers; add at least one with `with`")]
    EmptyReducerBuilder,
}

/// Sanitized description of an effect that terminated with an error.
///
/// The raw `anyhow::Error` is logged when the failure happens; this value
/// carries only what a reducer needs to react.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectFailed {
    /// `Debug` rendering of the action whose effect failed.
    pub action: String,
    /// The error's display message (outermost context only).
    pub message: String,
}

impl EffectFailed {
    pub(crate) fn from_error(action: &str, error: &anyhow::Error) -> Self {
        Self {
            action: action.to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for EffectFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "effect for {} failed: {}", self.action, self.message)
    }
}

/// What a store does with an effect that terminates with an error.
///
/// Either way the failing effect task stops and nothing else is affected:
/// the store, its state and every other in-flight effect keep running.
pub enum EffectErrorPolicy<A> {
    /// Log the error at `warn` and drop it.
    Swallow,
    /// Log the error, then send the action built by the closure.
    Feedback(Arc<dyn Fn(EffectFailed) -> A + Send + Sync>),
}

impl<A> EffectErrorPolicy<A> {
    /// Feed failures back into the store as typed actions.
    pub fn feedback<F>(f: F) -> Self
    where
        F: Fn(EffectFailed) -> A + Send + Sync + 'static,
    {
        Self::Feedback(Arc::new(f))
    }

    /// Map a failure to the action to send, if any. `failure` is only
    /// built when the policy feeds it back.
    pub(crate) fn action_for(&self, failure: impl FnOnce() -> EffectFailed) -> Option<A> {
        match self {
            Self::Swallow => None,
            Self::Feedback(f) => Some(f(failure())),
        }
    }
}

impl<A> Default for EffectErrorPolicy<A> {
    fn default() -> Self {
        Self::Swallow
    }
}

impl<A> Clone for EffectErrorPolicy<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Swallow => Self::Swallow,
            Self::Feedback(f) => Self::Feedback(f.clone()),
        }
    }
}

impl<A> fmt::Debug for EffectErrorPolicy<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Swallow => write!(f, "EffectErrorPolicy::Swallow"),
            Self::Feedback(_) => write!(f, "EffectErrorPolicy::Feedback(<fn>)"),
        }
    }
}
