//! Reducer trait and combinators.
//!
//! A reducer is a pure state transition: it takes the current state and one
//! action and returns the next state together with the effect to run.
//!
//! # Key Properties
//!
//! - **Pure**: no IO, no async, no hidden state between calls
//! - **Owned state in, owned state out**: the store threads the value through
//! - **Effects are descriptions**: returning an effect runs nothing yet
//!
//! # Example
//!
//! ```ignore
//! use composable::{Effect, ReduceExt, ReducerBuilder};
//!
//! #[derive(Debug, Clone)]
//! enum Action {
//!     Increment,
//!     Decrement,
//! }
//!
//! fn counter(count: i32, action: Action) -> (i32, Effect<Action>) {
//!     match action {
//!         Action::Increment => (count + 1).with_no_effect(),
//!         Action::Decrement => (count - 1).with_no_effect(),
//!     }
//! }
//!
//! let combined = ReducerBuilder::new().with(counter).with(counter).build();
//! ```

use crate::effect::Effect;
use crate::error::ComposableError;

/// A pure state transition function.
///
/// Any `Fn(S, A) -> (S, Effect<A>)` closure or function is a reducer.
///
/// # Guarantees
///
/// - Called serially by the store's dispatch loop (never concurrently)
/// - Called with the latest snapshot, including updates from the same burst
pub trait Reducer<S, A>: Send + Sync + 'static {
    /// Compute the next state and the effect to run.
    fn reduce(&self, state: S, action: A) -> (S, Effect<A>);
}

impl<S, A, F> Reducer<S, A> for F
where
    F: Fn(S, A) -> (S, Effect<A>) + Send + Sync + 'static,
{
    fn reduce(&self, state: S, action: A) -> (S, Effect<A>) {
        self(state, action)
    }
}

/// Result helpers for reducer bodies.
pub trait ReduceExt: Sized {
    /// Return this state with no effect.
    fn with_no_effect<A: Send + 'static>(self) -> (Self, Effect<A>) {
        (self, Effect::none())
    }

    /// Return this state with `effect`.
    fn with_effect<A: Send + 'static>(self, effect: Effect<A>) -> (Self, Effect<A>) {
        (self, effect)
    }

    /// Return this state with an effect that immediately sends `action`.
    fn with_action<A: Send + 'static>(self, action: A) -> (Self, Effect<A>) {
        (self, Effect::of(action))
    }
}

impl<T> ReduceExt for T {}

/// A reducer that leaves state untouched and runs nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyReducer;

impl<S, A: Send + 'static> Reducer<S, A> for EmptyReducer {
    fn reduce(&self, state: S, _action: A) -> (S, Effect<A>) {
        (state, Effect::none())
    }
}

/// Builder that combines several reducers into one.
///
/// The combined reducer hands every action to each reducer in the order
/// they were added, threading the state through, and concatenates their
/// effects in the same order.
pub struct ReducerBuilder<S, A> {
    reducers: Vec<Box<dyn Reducer<S, A>>>,
}

impl<S, A> ReducerBuilder<S, A>
where
    S: 'static,
    A: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            reducers: Vec::new(),
        }
    }

    /// Append a reducer.
    pub fn with<R: Reducer<S, A>>(mut self, reducer: R) -> Self {
        self.push(reducer);
        self
    }

    /// Append a reducer in place.
    pub fn push<R: Reducer<S, A>>(&mut self, reducer: R) {
        self.reducers.push(Box::new(reducer));
    }

    /// Finish the builder.
    ///
    /// # Panics
    ///
    /// Panics if no reducer was added. Use [`try_build`](Self::try_build)
    /// to handle that case.
    pub fn build(self) -> CombinedReducer<S, A> {
        match self.try_build() {
            Ok(reducer) => reducer,
            Err(err) => panic!("{err}"),
        }
    }

    /// Finish the builder, failing if no reducer was added.
    pub fn try_build(self) -> Result<CombinedReducer<S, A>, ComposableError> {
        if self.reducers.is_empty() {
            return Err(ComposableError::EmptyReducerBuilder);
        }
        Ok(CombinedReducer {
            reducers: self.reducers,
        })
    }
}

impl<S, A> Default for ReducerBuilder<S, A>
where
    S: 'static,
    A: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// The reducer produced by [`ReducerBuilder`].
pub struct CombinedReducer<S, A> {
    reducers: Vec<Box<dyn Reducer<S, A>>>,
}

impl<S, A> CombinedReducer<S, A> {
    /// Number of combined reducers.
    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }
}

impl<S, A> Reducer<S, A> for CombinedReducer<S, A>
where
    S: 'static,
    A: Clone + Send + 'static,
{
    fn reduce(&self, state: S, action: A) -> (S, Effect<A>) {
        let mut state = state;
        let mut effects = Vec::with_capacity(self.reducers.len());
        for reducer in &self.reducers {
            let (next, effect) = reducer.reduce(state, action.clone());
            state = next;
            effects.push(effect);
        }
        (state, Effect::concatenate(effects))
    }
}

impl<S, A> std::fmt::Debug for CombinedReducer<S, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedReducer")
            .field("reducers", &self.reducers.len())
            .finish()
    }
}
