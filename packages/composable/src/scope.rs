//! Scoped stores: a projected view of a root store.
//!
//! A scoped store shows `to_local(root state)` and forwards its actions to
//! the root as `from_local(action)`. The root stays the single owner of
//! ground-truth state.
//!
//! # Key Properties
//!
//! - **Direct to root**: a scope link holds the composed mappings from the
//!   root down to this store, so dispatch never hops through intermediate
//!   stores, however deep the chain
//! - **No cycles**: child stores reference the root; the root never
//!   references its children. The state subscription of a child holds a
//!   weak reference and stops once the child is gone
//! - **Flat teardown**: every scoped store's tasks hang off the root's task
//!   scope, so dropping an intermediate store leaves its descendants running
//! - **One publish per send**: a child re-projects after forwarding its own
//!   action and records which root publish it saw; the subscription skips
//!   root publishes the child has already projected
//!
//! # Example
//!
//! ```ignore
//! let root = Store::new(AppState::default(), app_reducer);
//!
//! let settings = root.scope(
//!     |app: &AppState| app.settings.clone(),
//!     AppAction::Settings,
//! );
//! settings.send(SettingsAction::ToggleDarkMode);
//! assert_eq!(settings.state(), root.state().settings);
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, trace};

use crate::effect::Effect;
use crate::error::EffectErrorPolicy;
use crate::owner::Operation;
use crate::reducer::Reducer;
use crate::store::{Store, StoreConfig};
use crate::task::TaskScope;

const SCOPE_NAME: &str = "scope";

/// Composed mappings between the root store and a scoped store.
pub(crate) struct ScopeLink<S, A> {
    /// Send a local action to the root.
    forward: Arc<dyn Fn(A) + Send + Sync>,
    /// Project the root's current state, tagged with the root publish it
    /// was read from.
    project: Arc<dyn Fn() -> (u64, S) + Send + Sync>,
    /// A fresh stream of root state change notifications.
    changes: Arc<dyn Fn() -> BoxStream<'static, ()> + Send + Sync>,
    /// The root's task scope; scoped stores spawn under it.
    root_tasks: TaskScope,
}

impl<S, A> ScopeLink<S, A>
where
    S: 'static,
    A: 'static,
{
    /// A link one level below `root`.
    fn from_root<RS, RA, F, G>(root: &Store<RS, RA>, to_local: F, from_local: G) -> Self
    where
        RS: Clone + Send + Sync + 'static,
        RA: Clone + Debug + Send + 'static,
        F: Fn(&RS) -> S + Send + Sync + 'static,
        G: Fn(A) -> RA + Send + Sync + 'static,
    {
        let sender = root.clone();
        let reader = root.clone();
        let template = root.subscribe();

        Self {
            forward: Arc::new(move |action| sender.send(from_local(action))),
            project: Arc::new(move || reader.inner.read_versioned(|state| to_local(state))),
            changes: Arc::new(move || {
                let mut rx = template.clone();
                let _ = rx.borrow_and_update();
                stream::unfold(rx, |mut rx| async move {
                    rx.changed().await.ok()?;
                    Some(((), rx))
                })
                .boxed()
            }),
            root_tasks: root.inner.tasks.clone(),
        }
    }

    /// A link one level below this one, still talking to the same root.
    fn rescope<L, LA, F, G>(&self, to_local: F, from_local: G) -> ScopeLink<L, LA>
    where
        L: 'static,
        LA: 'static,
        F: Fn(&S) -> L + Send + Sync + 'static,
        G: Fn(LA) -> A + Send + Sync + 'static,
    {
        let forward = self.forward.clone();
        let project = self.project.clone();
        ScopeLink {
            forward: Arc::new(move |action| forward(from_local(action))),
            project: Arc::new(move || {
                let (generation, state) = project();
                (generation, to_local(&state))
            }),
            changes: self.changes.clone(),
            root_tasks: self.root_tasks.clone(),
        }
    }

    pub(crate) fn project(&self) -> (u64, S) {
        (self.project)()
    }
}

impl<S, A> Clone for ScopeLink<S, A> {
    fn clone(&self) -> Self {
        Self {
            forward: self.forward.clone(),
            project: self.project.clone(),
            changes: self.changes.clone(),
            root_tasks: self.root_tasks.clone(),
        }
    }
}

/// Reducer of a scoped store: forwards to the root, then re-projects.
struct ForwardingReducer<S, A> {
    link: ScopeLink<S, A>,
    /// Latest root publish this store has projected.
    projected: Arc<AtomicU64>,
}

impl<S, A> Reducer<S, A> for ForwardingReducer<S, A>
where
    S: Send + 'static,
    A: Send + 'static,
{
    fn reduce(&self, _state: S, action: A) -> (S, Effect<A>) {
        (self.link.forward)(action);
        let (generation, state) = self.link.project();
        self.projected.fetch_max(generation, Ordering::AcqRel);
        (state, Effect::none())
    }
}

impl<S, A> Store<S, A>
where
    S: Clone + Send + Sync + 'static,
    A: Clone + Debug + Send + 'static,
{
    /// Derive a store showing `to_local(state)` whose actions are sent here
    /// as `from_local(action)`.
    ///
    /// The scoped store shares this store's owner checks and is torn down
    /// with the root store. Dropping every handle to the scoped store stops
    /// its state subscription; this store and stores scoped from the dropped
    /// one are unaffected.
    ///
    /// # Panics
    ///
    /// Panics off the owning thread when owner checks are enabled.
    pub fn scope<L, LA, F, G>(&self, to_local: F, from_local: G) -> Store<L, LA>
    where
        L: Clone + Send + Sync + 'static,
        LA: Clone + Debug + Send + 'static,
        F: Fn(&S) -> L + Send + Sync + 'static,
        G: Fn(LA) -> A + Send + Sync + 'static,
    {
        self.inner.owner.check(Operation::Scope);
        let link = match &self.inner.link {
            Some(link) => link.rescope(to_local, from_local),
            None => ScopeLink::from_root(self, to_local, from_local),
        };
        Store::from_link(self, link)
    }

    /// [`scope`](Self::scope) with the same action type.
    pub fn scope_state<L, F>(&self, to_local: F) -> Store<L, A>
    where
        L: Clone + Send + Sync + 'static,
        F: Fn(&S) -> L + Send + Sync + 'static,
    {
        self.scope(to_local, |action: A| action)
    }

    fn from_link<PS, PA>(parent: &Store<PS, PA>, link: ScopeLink<S, A>) -> Self {
        let changes = (link.changes)();
        let (generation, initial) = link.project();
        let projected = Arc::new(AtomicU64::new(generation));
        let reducer = ForwardingReducer {
            link: link.clone(),
            projected: projected.clone(),
        };
        let config = StoreConfig {
            name: SCOPE_NAME,
            owner: parent.inner.owner,
            error_policy: EffectErrorPolicy::Swallow,
        };
        let tasks = link.root_tasks.child(SCOPE_NAME);
        let child = Store::assemble(initial, Box::new(reducer), config, tasks, Some(link));

        let weak = Arc::downgrade(&child.inner);
        let mut changes = changes;
        let subscribed = child.inner.tasks.spawn(async move {
            while changes.next().await.is_some() {
                let Some(child) = weak.upgrade() else {
                    trace!("scoped store dropped, ending state subscription");
                    break;
                };
                let Some(link) = &child.link else {
                    break;
                };
                let (generation, state) = link.project();
                // Already projected by this store's own send.
                if projected.fetch_max(generation, Ordering::AcqRel) >= generation {
                    continue;
                }
                child.publish(state);
            }
        });
        if let Err(err) = subscribed {
            debug!(error = %err, "scoped store created under a torn-down store");
        }
        child
    }
}
