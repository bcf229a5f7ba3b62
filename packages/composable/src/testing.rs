//! Testing utilities for reducers and their effects.
//!
//! [`TestStore`] drives a real [`Store`] and asserts every step: the state
//! change caused by each sent action, and every action fed back by effects,
//! in order.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! composable = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Exhaustiveness
//!
//! A test fails when it:
//! - sends an action while effect actions are still waiting to be received
//! - ends with received actions it never asserted
//! - ends while an effect is still running (cancel long-living effects
//!   before the end of the test)
//!
//! # Example
//!
//! ```ignore
//! use composable::testing::TestStore;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_refresh() {
//!     let mut store = TestStore::new(State::default(), reducer);
//!
//!     store.send(Action::Refresh, |state| state.loading = true);
//!     store
//!         .receive(Action::Loaded(vec![1, 2]), |state| {
//!             state.loading = false;
//!             state.items = vec![1, 2];
//!         })
//!         .await;
//!
//!     store.finish().await;
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::effect::Effect;
use crate::reducer::Reducer;
use crate::store::Store;

/// How long `receive` and `finish` wait for effects by default.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
enum TestAction<A, LA> {
    Send(LA),
    Receive(A),
}

/// Bookkeeping shared between the test and the store's reducer.
struct Harness<A, S> {
    /// Effect actions, with the state right after reducing each.
    received: Mutex<VecDeque<(A, S)>>,
    /// Running effects, with the action that returned each.
    in_flight: Mutex<HashMap<Uuid, String>>,
    changed: Notify,
}

impl<A: Debug, S> Harness<A, S> {
    fn received(&self) -> MutexGuard<'_, VecDeque<(A, S)>> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_received(&self, action: A, state: S) {
        self.received().push_back((action, state));
        self.changed.notify_one();
    }

    fn unhandled(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|(action, _)| format!("{action:?}"))
            .collect()
    }

    /// Failure message for whatever the test left behind, if anything.
    fn leftovers(&self) -> Option<String> {
        let mut failures = Vec::new();

        let unhandled = self.unhandled();
        if !unhandled.is_empty() {
            failures.push(format!(
                "The store received {} unexpected action(s) after this one.\n\n\
                 Unhandled actions: {:#?}",
                unhandled.len(),
                unhandled
            ));
        }

        let mut running: Vec<String> = self.in_flight().values().cloned().collect();
        if !running.is_empty() {
            running.sort();
            failures.push(format!(
                "{} effect(s) still running at the end of the test, returned for: {:#?}\n\n\
                 Effects must complete, or be cancelled, before the test ends.",
                running.len(),
                running
            ));
        }

        (!failures.is_empty()).then(|| failures.join("\n\n---\n\n"))
    }
}

/// Marks an effect as running until dropped.
struct EffectToken<A: Debug, S> {
    id: Uuid,
    harness: Arc<Harness<A, S>>,
}

impl<A: Debug, S> EffectToken<A, S> {
    fn start(harness: &Arc<Harness<A, S>>, origin: String) -> Self {
        let id = Uuid::new_v4();
        harness.in_flight().insert(id, origin);
        Self {
            id,
            harness: harness.clone(),
        }
    }
}

impl<A: Debug, S> Drop for EffectToken<A, S> {
    fn drop(&mut self) {
        self.harness.in_flight().remove(&self.id);
        self.harness.changed.notify_one();
    }
}

fn track<A, S, LA>(
    harness: &Arc<Harness<A, S>>,
    effect: Effect<A>,
    origin: String,
) -> Effect<TestAction<A, LA>>
where
    A: Debug + Send + 'static,
    S: Send + 'static,
    LA: Send + 'static,
{
    if effect.is_none() {
        return Effect::none();
    }
    let token = EffectToken::start(harness, origin);
    effect.map(TestAction::Receive).guarded(move || token)
}

/// A store that asserts every state change and every effect action.
///
/// `LS`/`LA` are the state and action types the test talks in; they
/// default to the store's own. Use [`TestStore::scoped`] to test a feature
/// through a projection of a larger state.
pub struct TestStore<S, A, LS = S, LA = A>
where
    S: Clone + Send + Sync + 'static,
    A: Clone + PartialEq + Debug + Send + 'static,
    LS: Clone + PartialEq + Debug,
    LA: Clone + Debug + Send + 'static,
{
    store: Store<S, TestAction<A, LA>>,
    harness: Arc<Harness<A, S>>,
    to_local: Arc<dyn Fn(&S) -> LS + Send + Sync>,
    snapshot: LS,
    timeout: Duration,
    finished: bool,
}

impl<S, A> TestStore<S, A>
where
    S: Clone + PartialEq + Debug + Send + Sync + 'static,
    A: Clone + PartialEq + Debug + Send + 'static,
{
    pub fn new<R: Reducer<S, A>>(initial: S, reducer: R) -> Self {
        Self::scoped(initial, reducer, S::clone, |action: A| action)
    }
}

impl<S, A, LS, LA> TestStore<S, A, LS, LA>
where
    S: Clone + Send + Sync + 'static,
    A: Clone + PartialEq + Debug + Send + 'static,
    LS: Clone + PartialEq + Debug,
    LA: Clone + Debug + Send + 'static,
{
    /// Test `reducer` through the view `to_local` / `from_local`.
    pub fn scoped<R, F, G>(initial: S, reducer: R, to_local: F, from_local: G) -> Self
    where
        R: Reducer<S, A>,
        F: Fn(&S) -> LS + Send + Sync + 'static,
        G: Fn(LA) -> A + Send + Sync + 'static,
    {
        let harness = Arc::new(Harness {
            received: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        });

        let shared = harness.clone();
        let test_reducer = move |state: S, action: TestAction<A, LA>| match action {
            TestAction::Send(local) => {
                let action = from_local(local);
                let origin = format!("{action:?}");
                let (state, effect) = reducer.reduce(state, action);
                (state, track::<_, _, LA>(&shared, effect, origin))
            }
            TestAction::Receive(action) => {
                let origin = format!("{action:?}");
                let (state, effect) = reducer.reduce(state, action.clone());
                shared.push_received(action, state.clone());
                (state, track::<_, _, LA>(&shared, effect, origin))
            }
        };

        let snapshot = to_local(&initial);
        let store = Store::builder(initial, test_reducer)
            .with_name("test")
            .build();

        Self {
            store,
            harness,
            to_local: Arc::new(to_local),
            snapshot,
            timeout: DEFAULT_RECEIVE_TIMEOUT,
            finished: false,
        }
    }

    /// How long `receive` and `finish` wait for effects.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The current local state.
    pub fn state(&self) -> LS {
        self.store.with_state(|state| (self.to_local)(state))
    }

    /// Number of effects still running.
    pub fn running_effects(&self) -> usize {
        self.harness.in_flight().len()
    }

    /// Send `action` and assert the resulting state equals the previous
    /// state transformed by `update`.
    ///
    /// # Panics
    ///
    /// Panics if effect actions are waiting to be received, or if the state
    /// does not match.
    pub fn send(&mut self, action: LA, update: impl FnOnce(&mut LS)) {
        let pending = self.harness.unhandled();
        if !pending.is_empty() {
            panic!(
                "Must handle {} received action(s) before sending an action.\n\n\
                 Unhandled actions: {:#?}",
                pending.len(),
                pending
            );
        }

        let mut expected = self.snapshot.clone();
        update(&mut expected);
        self.store.send(TestAction::Send(action));

        let actual = self.state();
        self.expect_state(expected, actual);
    }

    /// Wait for the next effect action, assert it equals `expected`, and
    /// assert the state it produced equals the previous state transformed
    /// by `update`.
    ///
    /// # Panics
    ///
    /// Panics if no action arrives within the timeout, if the action
    /// differs, or if the state does not match.
    pub async fn receive(&mut self, expected: A, update: impl FnOnce(&mut LS)) {
        let (action, state) = self.next_received().await;
        if action != expected {
            panic!("Received unexpected action.\n\nExpected: {expected:#?}\nReceived: {action:#?}");
        }

        let mut expected_state = self.snapshot.clone();
        update(&mut expected_state);
        let actual = (self.to_local)(&state);
        self.expect_state(expected_state, actual);
    }

    /// Wait for running effects, then assert nothing was left unhandled.
    ///
    /// # Panics
    ///
    /// Panics if received actions were never asserted, or if an effect is
    /// still running once the timeout elapses.
    pub async fn finish(mut self) {
        let deadline = Instant::now() + self.timeout;
        while self.running_effects() > 0 {
            let notified = self.harness.changed.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        self.finished = true;
        self.store.teardown();
        if let Some(failure) = self.harness.leftovers() {
            panic!("{failure}");
        }
    }

    async fn next_received(&mut self) -> (A, S) {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(entry) = self.harness.received().pop_front() {
                return entry;
            }
            let notified = self.harness.changed.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                panic!(
                    "Expected to receive an action, but received none after {:?}.",
                    self.timeout
                );
            }
        }
    }

    fn expect_state(&mut self, expected: LS, actual: LS) {
        if actual != expected {
            panic!(
                "State change does not match expectation.\n\n\
                 Expected: {expected:#?}\nActual: {actual:#?}"
            );
        }
        self.snapshot = actual;
    }
}

impl<S, A, LS, LA> Drop for TestStore<S, A, LS, LA>
where
    S: Clone + Send + Sync + 'static,
    A: Clone + PartialEq + Debug + Send + 'static,
    LS: Clone + PartialEq + Debug,
    LA: Clone + Debug + Send + 'static,
{
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let failure = self.harness.leftovers();
        self.store.teardown();
        if let Some(failure) = failure {
            if !std::thread::panicking() {
                panic!("{failure}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationRegistry;
    use crate::reducer::ReduceExt;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct State {
        count: i32,
        ticks: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Action {
        Increment,
        Decrement,
        DelayedDecrement,
        Echo,
        StartTimer,
        StopTimer,
        Tick,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct TimerId;

    fn reducer(registry: CancellationRegistry) -> impl Reducer<State, Action> {
        move |mut state: State, action: Action| match action {
            Action::Increment => {
                state.count += 1;
                state.with_no_effect()
            }
            Action::Decrement => {
                state.count -= 1;
                state.with_no_effect()
            }
            Action::DelayedDecrement => state.with_effect(Effect::run(|emitter| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                emitter.emit(Action::Decrement);
                Ok(())
            })),
            Action::Echo => state.with_action(Action::Increment),
            Action::StartTimer => {
                let timer = Effect::run(|emitter| async move {
                    loop {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        if !emitter.emit(Action::Tick) {
                            return Ok(());
                        }
                    }
                });
                state.with_effect(timer.cancellable(&registry, TimerId, true))
            }
            Action::StopTimer => state.with_effect(registry.cancel(TimerId)),
            Action::Tick => {
                state.ticks += 1;
                state.with_no_effect()
            }
        }
    }

    fn test_store() -> TestStore<State, Action> {
        TestStore::new(State::default(), reducer(CancellationRegistry::new()))
    }

    #[tokio::test]
    async fn test_send_asserts_state() {
        let mut store = test_store();
        store.send(Action::Increment, |state| state.count = 1);
        store.send(Action::Decrement, |state| state.count = 0);
        store.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_effect_action() {
        let mut store = test_store();
        store.send(Action::Increment, |state| state.count = 1);
        store.send(Action::DelayedDecrement, |_| {});
        store.receive(Action::Decrement, |state| state.count = 0).await;
        store.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_living_effect_cancelled_in_test() {
        let mut store = test_store();
        store.send(Action::StartTimer, |_| {});
        store.receive(Action::Tick, |state| state.ticks = 1).await;
        store.receive(Action::Tick, |state| state.ticks = 2).await;
        store.send(Action::StopTimer, |_| {});
        store.finish().await;
    }

    #[tokio::test]
    async fn test_scoped_store() {
        let mut store = TestStore::scoped(
            State::default(),
            reducer(CancellationRegistry::new()),
            |state: &State| state.count,
            |increment: bool| {
                if increment {
                    Action::Increment
                } else {
                    Action::Decrement
                }
            },
        );
        store.send(true, |count| *count = 1);
        store.send(true, |count| *count = 2);
        store.send(false, |count| *count = 1);
        assert_eq!(store.state(), 1);
        store.finish().await;
    }

    #[tokio::test]
    #[should_panic(expected = "State change does not match expectation")]
    async fn test_state_mismatch_fails() {
        let mut store = test_store();
        store.send(Action::Increment, |state| state.count = 2);
    }

    #[tokio::test]
    #[should_panic(expected = "Received unexpected action")]
    async fn test_unexpected_action_fails() {
        let mut store = test_store();
        store.send(Action::Echo, |_| {});
        store.receive(Action::Decrement, |_| {}).await;
    }

    #[tokio::test]
    #[should_panic(expected = "Must handle 1 received action(s) before sending an action")]
    async fn test_send_with_pending_received_action_fails() {
        let mut store = test_store();
        store.send(Action::Echo, |_| {});
        // Let the effect deliver its action.
        while store.running_effects() > 0 {
            tokio::task::yield_now().await;
        }
        store.send(Action::Increment, |state| state.count = 2);
    }

    #[tokio::test]
    #[should_panic(expected = "The store received 1 unexpected action(s)")]
    async fn test_unhandled_received_action_fails_finish() {
        let mut store = test_store();
        store.send(Action::Echo, |_| {});
        store.finish().await;
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "received none after")]
    async fn test_receive_times_out() {
        let mut store = test_store().with_timeout(Duration::from_millis(50));
        store.send(Action::Increment, |state| state.count = 1);
        store.receive(Action::Decrement, |_| {}).await;
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "effect(s) still running at the end of the test")]
    async fn test_leaked_long_living_effect_fails_finish() {
        let mut store = test_store();
        store.send(Action::StartTimer, |_| {});
        store.receive(Action::Tick, |state| state.ticks = 1).await;
        store.finish().await;
    }

    #[tokio::test]
    #[should_panic(expected = "effect(s) still running at the end of the test")]
    async fn test_drop_without_finish_checks_leftovers() {
        let mut store = test_store();
        store.send(Action::DelayedDecrement, |_| {});
    }
}
