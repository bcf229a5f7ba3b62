//! Reducer composition: focusing a child reducer on part of a parent.
//!
//! A [`StatePath`] says where child state lives inside parent state; an
//! [`ActionPath`] says which parent action case carries child actions.
//! Together they lift a child reducer into the parent's domain.
//!
//! Actions are routed by matching on the parent's action enum, never by
//! runtime type inspection: an action path is a case extractor plus the
//! case constructor.
//!
//! # Example
//!
//! ```ignore
//! use composable::{scope_reducer, ActionPath, ReducerBuilder, StatePath};
//!
//! let settings = StatePath::new(
//!     |app: &AppState| app.settings.clone(),
//!     |mut app: AppState, settings| {
//!         app.settings = settings;
//!         app
//!     },
//! );
//! let settings_action = ActionPath::new(
//!     |action: &AppAction| match action {
//!         AppAction::Settings(a) => Some(a.clone()),
//!         _ => None,
//!     },
//!     AppAction::Settings,
//! );
//!
//! let app = ReducerBuilder::new()
//!     .with(scope_reducer(settings, settings_action, settings_reducer))
//!     .with(app_reducer)
//!     .build();
//! ```

use std::sync::Arc;

use crate::effect::Effect;
use crate::reducer::Reducer;

/// Extract and embed a child state inside a parent state.
pub struct StatePath<P, C> {
    extract: Arc<dyn Fn(&P) -> C + Send + Sync>,
    embed: Arc<dyn Fn(P, C) -> P + Send + Sync>,
}

impl<P, C> StatePath<P, C> {
    pub fn new<E, M>(extract: E, embed: M) -> Self
    where
        E: Fn(&P) -> C + Send + Sync + 'static,
        M: Fn(P, C) -> P + Send + Sync + 'static,
    {
        Self {
            extract: Arc::new(extract),
            embed: Arc::new(embed),
        }
    }

    pub fn extract(&self, parent: &P) -> C {
        (self.extract)(parent)
    }

    pub fn embed(&self, parent: P, child: C) -> P {
        (self.embed)(parent, child)
    }
}

impl<P, C> Clone for StatePath<P, C> {
    fn clone(&self) -> Self {
        Self {
            extract: self.extract.clone(),
            embed: self.embed.clone(),
        }
    }
}

/// Case-extract and embed a child action inside a parent action.
pub struct ActionPath<P, C> {
    extract: Arc<dyn Fn(&P) -> Option<C> + Send + Sync>,
    embed: Arc<dyn Fn(C) -> P + Send + Sync>,
}

impl<P, C> ActionPath<P, C> {
    pub fn new<E, M>(extract: E, embed: M) -> Self
    where
        E: Fn(&P) -> Option<C> + Send + Sync + 'static,
        M: Fn(C) -> P + Send + Sync + 'static,
    {
        Self {
            extract: Arc::new(extract),
            embed: Arc::new(embed),
        }
    }

    /// The child action carried by `parent`, if it is the child's case.
    pub fn extract(&self, parent: &P) -> Option<C> {
        (self.extract)(parent)
    }

    pub fn embed(&self, child: C) -> P {
        (self.embed)(child)
    }
}

impl<P, C> Clone for ActionPath<P, C> {
    fn clone(&self) -> Self {
        Self {
            extract: self.extract.clone(),
            embed: self.embed.clone(),
        }
    }
}

/// Run `child` on the child part of the state for matching actions.
///
/// Actions outside the child's case leave the state untouched.
pub fn scope_reducer<PS, PA, CS, CA, R>(
    state: StatePath<PS, CS>,
    action: ActionPath<PA, CA>,
    child: R,
) -> impl Reducer<PS, PA>
where
    PS: 'static,
    PA: Send + 'static,
    CS: 'static,
    CA: Send + 'static,
    R: Reducer<CS, CA>,
{
    move |parent: PS, parent_action: PA| {
        let Some(child_action) = action.extract(&parent_action) else {
            return (parent, Effect::none());
        };
        let (child_state, effect) = child.reduce(state.extract(&parent), child_action);
        let embed = action.clone();
        (
            state.embed(parent, child_state),
            effect.map(move |a| embed.embed(a)),
        )
    }
}

/// Like [`scope_reducer`] for child state that may be absent.
///
/// Matching actions that arrive while the child state is `None` are
/// ignored.
pub fn optional_scope<PS, PA, CS, CA, R>(
    state: StatePath<PS, Option<CS>>,
    action: ActionPath<PA, CA>,
    child: R,
) -> impl Reducer<PS, PA>
where
    PS: 'static,
    PA: Send + 'static,
    CS: 'static,
    CA: Send + 'static,
    R: Reducer<CS, CA>,
{
    move |parent: PS, parent_action: PA| {
        let Some(child_action) = action.extract(&parent_action) else {
            return (parent, Effect::none());
        };
        let Some(child_state) = state.extract(&parent) else {
            return (parent, Effect::none());
        };
        let (child_state, effect) = child.reduce(child_state, child_action);
        let embed = action.clone();
        (
            state.embed(parent, Some(child_state)),
            effect.map(move |a| embed.embed(a)),
        )
    }
}

/// Run `child` on optional child state, then `parent` on the whole state.
///
/// The child reducer sees child actions first, so the parent observes the
/// child's update (and may clear the child state in response). Effects of
/// both run concurrently.
///
/// # Panics
///
/// Panics when a child action arrives while the child state is `None`.
/// That is a logic error in the parent: it must not keep child effects
/// alive after clearing the child state.
pub fn optional<PS, PA, CS, CA, R, P>(
    state: StatePath<PS, Option<CS>>,
    action: ActionPath<PA, CA>,
    child: R,
    parent: P,
) -> impl Reducer<PS, PA>
where
    PS: 'static,
    PA: Send + 'static,
    CS: 'static,
    CA: Send + 'static,
    R: Reducer<CS, CA>,
    P: Reducer<PS, PA>,
{
    move |whole: PS, parent_action: PA| {
        let Some(child_action) = action.extract(&parent_action) else {
            return parent.reduce(whole, parent_action);
        };
        let Some(child_state) = state.extract(&whole) else {
            panic!(
                "optional received a child action when child state was absent. \
                 Cancel child effects before clearing the child state."
            );
        };

        let (child_state, child_effect) = child.reduce(child_state, child_action);
        let whole = state.embed(whole, Some(child_state));
        let (whole, parent_effect) = parent.reduce(whole, parent_action);

        let embed = action.clone();
        (
            whole,
            Effect::merge([child_effect.map(move |a| embed.embed(a)), parent_effect]),
        )
    }
}

/// Actions of a [`lifecycle`] reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction<A> {
    /// The feature became visible; starts the appear effect.
    OnAppear,
    /// The feature went away; starts the teardown effect.
    OnDisappear,
    /// An action of the wrapped feature.
    Wrapped(A),
}

/// Wrap a reducer with appear/disappear hooks.
///
/// The wrapped state is optional: `Wrapped` actions are routed to `wrapped`
/// while the state is present. `on_appear` effects feed their output back
/// as `Wrapped` actions; `on_disappear` effects produce no actions, so
/// they are typically cancellations of what `on_appear` started.
///
/// # Panics
///
/// Panics when a `Wrapped` action arrives while the state is `None`.
pub fn lifecycle<S, A, R, OnAppear, OnDisappear>(
    wrapped: R,
    on_appear: OnAppear,
    on_disappear: OnDisappear,
) -> impl Reducer<Option<S>, LifecycleAction<A>>
where
    S: 'static,
    A: Send + 'static,
    R: Reducer<S, A>,
    OnAppear: Fn() -> Effect<A> + Send + Sync + 'static,
    OnDisappear: Fn() -> Effect<()> + Send + Sync + 'static,
{
    move |state: Option<S>, action: LifecycleAction<A>| match action {
        LifecycleAction::OnAppear => (state, on_appear().map(LifecycleAction::Wrapped)),
        LifecycleAction::OnDisappear => (state, on_disappear().ignore_output()),
        LifecycleAction::Wrapped(action) => {
            let Some(inner) = state else {
                panic!("lifecycle received a wrapped action while its state was absent");
            };
            let (inner, effect) = wrapped.reduce(inner, action);
            (Some(inner), effect.map(LifecycleAction::Wrapped))
        }
    }
}
