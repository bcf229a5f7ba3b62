//! # Composable
//!
//! A unidirectional state container: reducers decide, effects run, and every
//! action flows through one serialized dispatch loop.
//!
//! ## Core Concepts
//!
//! A [`Store`] owns a value of state and a [`Reducer`]:
//! - **Actions** describe what happened (user input, effect results)
//! - **Reducers** fold an action into the state and return an [`Effect`]
//! - **Effects** are asynchronous streams of further actions
//!
//! Reducers are pure. All IO lives in effects, and effect output re-enters the
//! store through the same `send` path as user input.
//!
//! ## Architecture
//!
//! ```text
//! caller / effect task
//!     │
//!     ▼ send()
//! Store ─► buffered queue ◄──────────────────────┐
//!     │                                          │
//!     ▼ drain (one burst, one snapshot)          │
//! Reducer.reduce(state, action)                  │
//!     │                                          │
//!     ├─► new state ─► watch::Sender ─► observe()│
//!     │                                          │
//!     └─► Effect ─► TaskScope.spawn()            │
//!                     │                          │
//!                     └─► each Ok(action) ───────┘
//!
//! Store::scope(to_local, from_local)
//!     │
//!     └─► child store ─► forward() ─► root.send()
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single source of truth** - Only the root reducer changes ground-truth state;
//!    scoped stores forward their actions to it and re-project
//! 2. **Reentrant send** - Actions sent while reducing are buffered, never nested
//! 3. **FIFO order** - Buffered actions are reduced in the order they were sent
//! 4. **One publish per burst** - Observers see the state after the queue drains
//! 5. **Scopes point up** - Child stores hold the root, the root never holds children
//! 6. **Lazy cancellation** - A cancellable effect registers when it first runs
//!
//! ## Example
//!
//! ```ignore
//! use composable::{CancellationRegistry, Effect, ReduceExt, Store};
//! use std::time::Duration;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum SearchAction {
//!     QueryChanged(String),
//!     Results(Vec<String>),
//! }
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Search {
//!     query: String,
//!     results: Vec<String>,
//! }
//!
//! let registry = CancellationRegistry::new();
//! let store = Store::new(Search::default(), move |mut state: Search, action| match action {
//!     SearchAction::QueryChanged(query) => {
//!         state.query = query.clone();
//!         let lookup = Effect::future(async move {
//!             SearchAction::Results(api::search(&query).await)
//!         });
//!         state.with_effect(lookup.debounce(&registry, "search", Duration::from_millis(300)))
//!     }
//!     SearchAction::Results(results) => {
//!         state.results = results;
//!         state.with_no_effect()
//!     }
//! });
//!
//! let _sub = store.observe(|state| println!("{} results", state.results.len()));
//! store.send(SearchAction::QueryChanged("rust".into()));
//! ```
//!
//! ## What This Is Not
//!
//! Composable is **not**:
//! - A persistence layer
//! - A UI binding
//! - An actor framework
//!
//! State lives in memory for as long as the root store does.

// Core modules
mod cancellation;
mod compose;
mod effect;
mod error;
mod lock;
mod owner;
mod reducer;
mod scope;
mod store;
mod task;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export effect types
pub use effect::{Effect, Emitter};

// Re-export cancellation types
pub use cancellation::{CancelId, CancellationRegistry};

// Re-export reducer types
pub use reducer::{CombinedReducer, EmptyReducer, ReduceExt, Reducer, ReducerBuilder};

// Re-export composition helpers
pub use compose::{
    lifecycle, optional, optional_scope, scope_reducer, ActionPath, LifecycleAction, StatePath,
};

// Re-export store types (primary entry point)
pub use store::{Store, StoreBuilder, Subscription};

// Re-export error types
pub use error::{ComposableError, EffectErrorPolicy, EffectFailed};

// Re-export task supervision
pub use task::TaskScope;
