//! Store: the serialized owner of one state value.
//!
//! # Dispatch
//!
//! `send` appends to a buffer. The outermost `send` on the stack drains the
//! buffer in order, running each action through the reducer against the
//! latest snapshot and starting each non-empty effect as a background task.
//! A `send` that arrives while the buffer is being drained (from an effect
//! task, or from a scoped store forwarding upward) only appends.
//!
//! The final snapshot of a burst is published once, after the buffer is
//! empty, so observers never see the intermediate states of one burst.
//!
//! # Effects
//!
//! Effect tasks hold a weak reference to the store. Each value an effect
//! produces is fed back through `send`. An effect that fails stops, and the
//! store's [`EffectErrorPolicy`] decides whether the failure becomes an
//! action. Dropping or tearing down the store aborts every effect.
//!
//! # Example
//!
//! ```ignore
//! use composable::{Effect, ReduceExt, Store};
//!
//! let store = Store::new(0, |count: i32, action: Action| match action {
//!     Action::Increment => (count + 1).with_no_effect(),
//!     Action::Refresh => count.with_effect(Effect::future(fetch_count()).map(Action::Loaded)),
//!     Action::Loaded(count) => count.with_no_effect(),
//! });
//!
//! store.send(Action::Increment);
//! assert_eq!(store.state(), 1);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::effect::Effect;
use crate::error::{ComposableError, EffectErrorPolicy, EffectFailed};
use crate::owner::{Operation, OwnerGuard};
use crate::reducer::Reducer;
use crate::scope::ScopeLink;
use crate::task::TaskScope;

const DEFAULT_STORE_NAME: &str = "store";

/// A handle to a store. Clones share the same state and dispatch loop.
pub struct Store<S, A> {
    pub(crate) inner: Arc<StoreInner<S, A>>,
}

pub(crate) struct StoreInner<S, A> {
    name: &'static str,
    reducer: Box<dyn Reducer<S, A>>,
    queue: Mutex<DispatchQueue<A>>,
    state: watch::Sender<S>,
    /// Bumped with every publish, while the new state is being written.
    generation: AtomicU64,
    /// Subscriptions; torn down together with `effects`.
    pub(crate) tasks: TaskScope,
    effects: TaskScope,
    pub(crate) owner: OwnerGuard,
    error_policy: EffectErrorPolicy<A>,
    /// Present on scoped stores.
    pub(crate) link: Option<ScopeLink<S, A>>,
}

struct DispatchQueue<A> {
    buffered: VecDeque<A>,
    dispatching: bool,
}

/// Settings shared by root and scoped stores.
pub(crate) struct StoreConfig<A> {
    pub(crate) name: &'static str,
    pub(crate) owner: OwnerGuard,
    pub(crate) error_policy: EffectErrorPolicy<A>,
}

impl<S, A> Store<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Clone + fmt::Debug + Send + 'static,
{
    /// Create a store on the current tokio runtime with default settings.
    ///
    /// # Panics
    ///
    /// Panics outside of a tokio runtime. Use [`Store::builder`] with
    /// [`StoreBuilder::try_build`] to handle that case.
    pub fn new<R: Reducer<S, A>>(initial: S, reducer: R) -> Self {
        Self::builder(initial, reducer).build()
    }

    pub fn builder<R: Reducer<S, A>>(initial: S, reducer: R) -> StoreBuilder<S, A> {
        StoreBuilder::new(initial, reducer)
    }

    pub(crate) fn assemble(
        initial: S,
        reducer: Box<dyn Reducer<S, A>>,
        config: StoreConfig<A>,
        tasks: TaskScope,
        link: Option<ScopeLink<S, A>>,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        let effects = tasks.child("effects");
        debug!(store = config.name, scoped = link.is_some(), "store created");
        Self {
            inner: Arc::new(StoreInner {
                name: config.name,
                reducer,
                queue: Mutex::new(DispatchQueue {
                    buffered: VecDeque::new(),
                    dispatching: false,
                }),
                state,
                generation: AtomicU64::new(0),
                tasks,
                effects,
                owner: config.owner,
                error_policy: config.error_policy,
                link,
            }),
        }
    }

    /// Run `action` through the reducer, after every action already queued.
    ///
    /// # Panics
    ///
    /// Panics off the owning thread when owner checks are enabled.
    pub fn send(&self, action: A) {
        self.inner.owner.check(Operation::Send(&action));
        self.inner.send(action);
    }

    /// A copy of the latest published state.
    pub fn state(&self) -> S {
        self.inner.state.borrow().clone()
    }

    /// Read the latest published state without cloning it.
    ///
    /// `f` must not send to this store.
    pub fn with_state<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.inner.state.borrow())
    }

    /// Current value plus every later publish.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.inner.state.subscribe()
    }

    /// Call `on_each` with the current state, then with every published
    /// state that differs from the previous one.
    ///
    /// Updates stop when the returned [`Subscription`] is closed or dropped,
    /// or when the store is torn down.
    pub fn observe<F>(&self, mut on_each: F) -> Subscription
    where
        S: PartialEq,
        F: FnMut(&S) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let mut last = rx.borrow_and_update().clone();
        on_each(&last);

        let (abort, registration) = AbortHandle::new_pair();
        let updates = Abortable::new(
            async move {
                while rx.changed().await.is_ok() {
                    let next = rx.borrow_and_update().clone();
                    if next != last {
                        on_each(&next);
                        last = next;
                    }
                }
            },
            registration,
        );

        if let Err(err) = self.inner.tasks.spawn(async move {
            let _ = updates.await;
        }) {
            debug!(store = self.inner.name, error = %err, "observer not started");
        }
        Subscription { abort }
    }

    /// Number of effect tasks still running.
    pub fn active_effects(&self) -> usize {
        self.inner.effects.active()
    }

    /// Abort every effect and subscription of this store and of every
    /// store scoped from it.
    ///
    /// The store keeps accepting actions afterwards, but their effects are
    /// not started.
    pub fn teardown(&self) {
        self.inner.tasks.cancel_all();
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.tasks.is_closed()
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

impl<S, A> StoreInner<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Clone + fmt::Debug + Send + 'static,
{
    fn lock_queue(&self) -> MutexGuard<'_, DispatchQueue<A>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn send(self: &Arc<Self>, action: A) {
        {
            let mut queue = self.lock_queue();
            queue.buffered.push_back(action);
            if queue.dispatching {
                return;
            }
            queue.dispatching = true;
        }

        let mut burst = BurstGuard {
            inner: self,
            armed: true,
        };
        let mut current = self.state.borrow().clone();

        loop {
            let action = {
                let mut queue = self.lock_queue();
                match queue.buffered.pop_front() {
                    Some(action) => action,
                    None => {
                        // Publish and release under the same lock, so a
                        // concurrent send either lands in this burst or
                        // starts the next one.
                        self.publish(current);
                        queue.dispatching = false;
                        break;
                    }
                }
            };

            trace!(store = self.name, ?action, "reducing action");
            let origin = action.clone();
            let (next, effect) = self.reducer.reduce(current, action);
            current = next;

            if !effect.is_none() {
                self.start_effect(effect, origin);
            }
        }

        burst.armed = false;
    }

    /// Replace the published state.
    pub(crate) fn publish(&self, state: S) {
        self.state.send_modify(|published| {
            *published = state;
            self.generation.fetch_add(1, Ordering::AcqRel);
        });
    }

    /// Read the published state together with the publish that produced it.
    pub(crate) fn read_versioned<R>(&self, f: impl FnOnce(&S) -> R) -> (u64, R) {
        let state = self.state.borrow();
        let generation = self.generation.load(Ordering::Acquire);
        (generation, f(&state))
    }

    /// Spawn `effect`. `origin` is rendered only for logs and failures.
    fn start_effect(self: &Arc<Self>, effect: Effect<A>, origin: A) {
        let store = Arc::downgrade(self);
        let name = self.name;
        let owner = self.owner;
        let mut stream = effect.into_stream();

        let started = self.effects.spawn(async move {
            trace!(store = name, action = ?origin, "effect started");
            while let Some(item) = stream.next().await {
                let Some(store) = store.upgrade() else {
                    break;
                };
                owner.check(Operation::EffectCompletion(&origin));
                match item {
                    Ok(action) => store.send(action),
                    Err(err) => {
                        warn!(store = name, action = ?origin, error = ?err, "effect failed");
                        let failure = || EffectFailed::from_error(&format!("{origin:?}"), &err);
                        if let Some(action) = store.error_policy.action_for(failure) {
                            store.send(action);
                        }
                        break;
                    }
                }
            }
            trace!(store = name, action = ?origin, "effect finished");
        });

        if let Err(err) = started {
            debug!(store = self.name, error = %err, "effect not started");
        }
    }
}

impl<S, A> Drop for StoreInner<S, A> {
    fn drop(&mut self) {
        self.tasks.cancel_all();
    }
}

/// Resets the dispatch state if a reducer panics mid-burst.
struct BurstGuard<'a, S, A> {
    inner: &'a StoreInner<S, A>,
    armed: bool,
}

impl<S, A> Drop for BurstGuard<'_, S, A> {
    fn drop(&mut self) {
        if self.armed {
            let mut queue = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let dropped = queue.buffered.len();
            queue.buffered.clear();
            queue.dispatching = false;
            warn!(
                store = self.inner.name,
                dropped, "reducer panicked, discarding buffered actions"
            );
        }
    }
}

impl<S, A> Clone for Store<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, A> fmt::Debug for Store<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("active_effects", &self.inner.effects.active())
            .field("torn_down", &self.inner.tasks.is_closed())
            .field("scoped", &self.inner.link.is_some())
            .field("owner_checks", &self.inner.owner.is_enabled())
            .finish()
    }
}

/// Teardown handle returned by [`Store::observe`].
#[derive(Debug)]
pub struct Subscription {
    abort: AbortHandle,
}

impl Subscription {
    /// Stop delivering updates. Idempotent.
    pub fn close(&self) {
        self.abort.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.abort.is_aborted()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for root stores.
pub struct StoreBuilder<S, A> {
    initial: S,
    reducer: Box<dyn Reducer<S, A>>,
    runtime: Option<Handle>,
    owner_checks: bool,
    error_policy: EffectErrorPolicy<A>,
    name: &'static str,
}

impl<S, A> StoreBuilder<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Clone + fmt::Debug + Send + 'static,
{
    pub fn new<R: Reducer<S, A>>(initial: S, reducer: R) -> Self {
        Self {
            initial,
            reducer: Box::new(reducer),
            runtime: None,
            owner_checks: false,
            error_policy: EffectErrorPolicy::Swallow,
            name: DEFAULT_STORE_NAME,
        }
    }

    /// Spawn effects onto `runtime` instead of the current runtime.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Panic when the store is used off the thread that built it.
    ///
    /// Effects then have to complete on that thread too, so enable this
    /// only with a current-thread runtime or a `LocalSet`.
    pub fn with_owner_checks(mut self, enabled: bool) -> Self {
        self.owner_checks = enabled;
        self
    }

    /// Decide what happens when an effect fails. Defaults to
    /// [`EffectErrorPolicy::Swallow`].
    pub fn with_error_policy(mut self, policy: EffectErrorPolicy<A>) -> Self {
        self.error_policy = policy;
        self
    }

    /// Name used in log fields.
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Build the store.
    ///
    /// # Panics
    ///
    /// Panics when no runtime was given and none is running.
    pub fn build(self) -> Store<S, A> {
        match self.try_build() {
            Ok(store) => store,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn try_build(self) -> Result<Store<S, A>, ComposableError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()?,
        };
        let config = StoreConfig {
            name: self.name,
            owner: OwnerGuard::new(self.owner_checks),
            error_policy: self.error_policy,
        };
        Ok(Store::assemble(
            self.initial,
            self.reducer,
            config,
            TaskScope::new(self.name, runtime),
            None,
        ))
    }
}

impl<S, A> fmt::Debug for StoreBuilder<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("name", &self.name)
            .field("owner_checks", &self.owner_checks)
            .field("error_policy", &self.error_policy)
            .finish_non_exhaustive()
    }
}
