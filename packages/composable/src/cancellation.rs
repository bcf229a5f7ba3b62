//! Cancellation registry: tag effects with an identity and cancel them.
//!
//! The registry maps a [`CancelId`] to the handles of every effect that is
//! currently running under it. A handle exists only while its effect runs:
//! it is registered when the effect starts and removes itself when the
//! effect completes, is cancelled, or is dropped with its store.
//!
//! # Locking
//!
//! Registration and cancellation sweeps run under the registry's gate, a
//! reentrant async lock. A handle cancelled from inside a sweep re-enters
//! the gate on the same task instead of deadlocking.
//!
//! # Example
//!
//! ```ignore
//! use composable::{CancellationRegistry, Effect};
//!
//! #[derive(Debug, Hash, PartialEq, Eq)]
//! struct SearchRequest;
//!
//! let registry = CancellationRegistry::global();
//!
//! // Starting a new search tears down the previous one first.
//! let search = Effect::future(api.search(query))
//!     .map(Action::SearchResponse)
//!     .cancellable(registry, SearchRequest, true);
//!
//! // Explicit teardown, e.g. when the screen goes away.
//! let stop = registry.cancel::<Action, _>(SearchRequest);
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, AbortHandle, Abortable, BoxStream, Stream, StreamExt};
use smallvec::SmallVec;
use tracing::trace;

use crate::effect::Effect;
use crate::lock::ReentrantGate;

// =============================================================================
// Cancellation Identity
// =============================================================================

/// Object-safe equality and hashing for identity values.
trait IdentityKey: Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_key(&self, other: &dyn IdentityKey) -> bool;
    fn hash_key(&self, state: &mut dyn Hasher);
}

impl<K> IdentityKey for K
where
    K: Any + Eq + Hash + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_key(&self, other: &dyn IdentityKey) -> bool {
        other.as_any().downcast_ref::<K>() == Some(self)
    }

    fn hash_key(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<K>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// Type-erased cancellation identity.
///
/// Any `Eq + Hash + Debug` value can act as an identity. Values of different
/// types never compare equal, so `1u32` and `1u64` are distinct identities.
#[derive(Clone)]
pub struct CancelId(Arc<dyn IdentityKey>);

impl CancelId {
    /// Wrap an identity value. Wrapping a `CancelId` returns it unchanged.
    pub fn new<K>(key: K) -> Self
    where
        K: Any + Eq + Hash + Send + Sync + fmt::Debug,
    {
        if let Some(id) = (&key as &dyn Any).downcast_ref::<CancelId>() {
            return id.clone();
        }
        Self(Arc::new(key))
    }
}

impl PartialEq for CancelId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_key(&*other.0)
    }
}

impl Eq for CancelId {}

impl Hash for CancelId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_key(state);
    }
}

impl fmt::Debug for CancelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelId").field(&self.0).finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Clone)]
struct CancelHandle {
    id: u64,
    abort: AbortHandle,
}

/// Maps identities to the handles of their running effects.
///
/// Cheap to clone; clones share the same map. Construct one per test to
/// keep tests independent, or use [`CancellationRegistry::global`].
#[derive(Clone)]
pub struct CancellationRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    gate: ReentrantGate,
    handles: DashMap<CancelId, SmallVec<[CancelHandle; 2]>>,
    next_handle: AtomicU64,
}

impl CancellationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                gate: ReentrantGate::new(),
                handles: DashMap::new(),
                next_handle: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static CancellationRegistry {
        static GLOBAL: OnceLock<CancellationRegistry> = OnceLock::new();
        GLOBAL.get_or_init(CancellationRegistry::new)
    }

    /// Wrap `effect` so it can be cancelled through `id`.
    ///
    /// With `cancel_in_flight`, every effect already running under `id` is
    /// torn down before this one starts.
    ///
    /// Apply this to the effect that does the work, before mapping its
    /// output: the handle tracks the stream it wraps.
    pub fn cancellable<T, K>(&self, effect: Effect<T>, id: K, cancel_in_flight: bool) -> Effect<T>
    where
        T: Send + 'static,
        K: Any + Eq + Hash + Send + Sync + fmt::Debug,
    {
        let id = CancelId::new(id);
        let registry = self.clone();
        let key = id.clone();
        let registered = Effect::from_raw(
            stream::once(async move { registry.register(key, effect.into_stream()).await })
                .flatten()
                .boxed(),
        );

        if cancel_in_flight {
            Effect::concatenate([self.cancel(id), registered])
        } else {
            registered
        }
    }

    /// An effect that cancels every effect currently running under `id`.
    ///
    /// Cancelling an identity with nothing registered is a no-op.
    pub fn cancel<T, K>(&self, id: K) -> Effect<T>
    where
        T: Send + 'static,
        K: Any + Eq + Hash + Send + Sync + fmt::Debug,
    {
        let id = CancelId::new(id);
        let registry = self.clone();
        Effect::fire_and_forget(move || async move { registry.cancel_now(&id).await })
    }

    /// An effect that cancels every effect under any of `ids`.
    pub fn cancel_all<T, K, I>(&self, ids: I) -> Effect<T>
    where
        T: Send + 'static,
        K: Any + Eq + Hash + Send + Sync + fmt::Debug,
        I: IntoIterator<Item = K>,
    {
        Effect::merge(ids.into_iter().map(|id| self.cancel(id)))
    }

    /// Cancel every effect currently running under `id`, immediately.
    pub async fn cancel_now(&self, id: &CancelId) {
        self.inner
            .gate
            .with_lock(async {
                // Snapshot: each cancel removes its handle from the live set.
                let handles: SmallVec<[CancelHandle; 2]> = self
                    .inner
                    .handles
                    .get(id)
                    .map(|set| set.value().clone())
                    .unwrap_or_default();

                trace!(?id, count = handles.len(), "cancelling effects");
                for handle in handles {
                    self.cancel_handle(id, handle).await;
                }
            })
            .await;
    }

    /// Whether any effect is running under `id`.
    pub fn is_registered<K>(&self, id: K) -> bool
    where
        K: Any + Eq + Hash + Send + Sync + fmt::Debug,
    {
        self.inner.handles.contains_key(&CancelId::new(id))
    }

    /// Number of effects running under `id`.
    pub fn handle_count<K>(&self, id: K) -> usize
    where
        K: Any + Eq + Hash + Send + Sync + fmt::Debug,
    {
        self.inner
            .handles
            .get(&CancelId::new(id))
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Number of identities with at least one running effect.
    pub fn len(&self) -> usize {
        self.inner.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.handles.is_empty()
    }

    /// Abort every registered effect and clear the map.
    pub fn reset(&self) {
        let ids: Vec<CancelId> = self
            .inner
            .handles
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, handles)) = self.inner.handles.remove(&id) {
                for handle in handles {
                    handle.abort.abort();
                }
            }
        }
    }

    async fn register<T>(
        &self,
        id: CancelId,
        effect: BoxStream<'static, anyhow::Result<T>>,
    ) -> Registered<T> {
        self.inner
            .gate
            .with_lock(async {
                let (abort, registration) = AbortHandle::new_pair();
                let handle_id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .handles
                    .entry(id.clone())
                    .or_default()
                    .push(CancelHandle {
                        id: handle_id,
                        abort,
                    });
                trace!(?id, handle = handle_id, "registered cancellable effect");

                Registered {
                    stream: Abortable::new(effect, registration),
                    _registration: Registration {
                        registry: self.clone(),
                        id,
                        handle_id,
                    },
                }
            })
            .await
    }

    async fn cancel_handle(&self, id: &CancelId, handle: CancelHandle) {
        self.inner
            .gate
            .with_lock(async {
                handle.abort.abort();
                self.remove_handle(id, handle.id);
            })
            .await;
    }

    fn remove_handle(&self, id: &CancelId, handle_id: u64) {
        if let Some(mut set) = self.inner.handles.get_mut(id) {
            set.retain(|h| h.id != handle_id);
        }
        self.inner.handles.remove_if(id, |_, set| set.is_empty());
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("identities", &self.len())
            .finish()
    }
}

/// Removes its handle from the registry when dropped.
struct Registration {
    registry: CancellationRegistry,
    id: CancelId,
    handle_id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove_handle(&self.id, self.handle_id);
        trace!(id = ?self.id, handle = self.handle_id, "released cancellable effect");
    }
}

/// A registered effect stream. Ends early once its handle is aborted.
struct Registered<T> {
    stream: Abortable<BoxStream<'static, anyhow::Result<T>>>,
    _registration: Registration,
}

impl<T> Stream for Registered<T> {
    type Item = anyhow::Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

// =============================================================================
// Effect Extensions
// =============================================================================

impl<T: Send + 'static> Effect<T> {
    /// See [`CancellationRegistry::cancellable`].
    pub fn cancellable<K>(
        self,
        registry: &CancellationRegistry,
        id: K,
        cancel_in_flight: bool,
    ) -> Self
    where
        K: Any + Eq + Hash + Send + Sync + fmt::Debug,
    {
        registry.cancellable(self, id, cancel_in_flight)
    }

    /// Delay this effect by `due`, restarting the delay whenever another
    /// debounced effect with the same `id` starts.
    ///
    /// The wrapped effect is not started until the delay elapses, so work
    /// that gets overtaken never runs.
    pub fn debounce<K>(self, registry: &CancellationRegistry, id: K, due: Duration) -> Self
    where
        K: Any + Eq + Hash + Send + Sync + fmt::Debug,
    {
        Effect::fire_and_forget(move || tokio::time::sleep(due))
            .then(self)
            .cancellable(registry, id, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use futures::channel::mpsc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct CancelToken;

    /// Drive `effect` on a background task, forwarding values to a channel.
    fn spawn_collect<T: Send + 'static>(
        effect: Effect<T>,
    ) -> (
        tokio::sync::mpsc::UnboundedReceiver<T>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut stream = effect.into_stream();
            while let Some(item) = stream.next().await {
                if tx.send(item.expect("effect failed")).is_err() {
                    break;
                }
            }
        });
        (rx, task)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_cancel_id_equality() {
        assert_eq!(CancelId::new(CancelToken), CancelId::new(CancelToken));
        assert_eq!(CancelId::new("search"), CancelId::new("search"));
        assert_ne!(CancelId::new(1u32), CancelId::new(1u64));
        assert_ne!(CancelId::new("a"), CancelId::new("b"));

        let id = CancelId::new(7);
        assert_eq!(CancelId::new(id.clone()), id);

        let set: HashSet<CancelId> = [CancelId::new(1), CancelId::new(1), CancelId::new(2)]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let registry = CancellationRegistry::new();
        let (source, values) = mpsc::unbounded::<i32>();

        let (mut rx, task) =
            spawn_collect(Effect::from_stream(values).cancellable(&registry, CancelToken, false));

        source.unbounded_send(1).unwrap();
        assert_eq!(rx.recv().await, Some(1));
        source.unbounded_send(2).unwrap();
        assert_eq!(rx.recv().await, Some(2));
        assert!(registry.is_registered(CancelToken));

        registry.cancel_now(&CancelId::new(CancelToken)).await;

        let _ = source.unbounded_send(3);
        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let registry = CancellationRegistry::new();
        let (first_source, first_values) = mpsc::unbounded::<i32>();
        let (second_source, second_values) = mpsc::unbounded::<i32>();

        let (mut first, first_task) = spawn_collect(
            Effect::from_stream(first_values).cancellable(&registry, CancelToken, true),
        );
        first_source.unbounded_send(1).unwrap();
        assert_eq!(first.recv().await, Some(1));

        let (mut second, _second_task) = spawn_collect(
            Effect::from_stream(second_values).cancellable(&registry, CancelToken, true),
        );

        // The first run is torn down before the second one starts.
        first_task.await.unwrap();
        assert_eq!(first.recv().await, None);
        let _ = first_source.unbounded_send(2);

        second_source.unbounded_send(3).unwrap();
        assert_eq!(second.recv().await, Some(3));
        assert_eq!(registry.handle_count(CancelToken), 1);

        registry.reset();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_in_flight_after_mapping() {
        let registry = CancellationRegistry::new();
        let effect = Effect::of(1)
            .cancellable(&registry, CancelToken, true)
            .map(|v| v + v);

        let values: Vec<i32> = effect
            .into_stream()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_after_delay() {
        let registry = CancellationRegistry::new();
        let effect = Effect::run(|emitter| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            emitter.emit(1);
            Ok(())
        })
        .cancellable(&registry, CancelToken, false);

        let (mut rx, task) = spawn_collect(effect);
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.cancel_now(&CancelId::new(CancelToken)).await;

        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_cleanup_on_completion() {
        let registry = CancellationRegistry::new();
        let values: Vec<anyhow::Result<i32>> = Effect::of(1)
            .cancellable(&registry, 1, false)
            .into_stream()
            .collect()
            .await;

        assert_eq!(values.len(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_on_cancel() {
        let registry = CancellationRegistry::new();
        let effect = Effect::run(|emitter| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            emitter.emit(1);
            Ok(())
        })
        .cancellable(&registry, 1, false);

        let (_rx, task) = spawn_collect(effect);
        settle().await;
        assert!(registry.is_registered(1));

        let _: Vec<_> = registry.cancel::<(), _>(1).into_stream().collect().await;
        task.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_double_cancellable_registers_each_wrap() {
        let registry = CancellationRegistry::new();
        let (source, values) = mpsc::unbounded::<i32>();

        let (mut rx, task) = spawn_collect(
            Effect::from_stream(values)
                .cancellable(&registry, CancelToken, false)
                .cancellable(&registry, CancelToken, false),
        );

        source.unbounded_send(1).unwrap();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(registry.handle_count(CancelToken), 2);

        let _: Vec<_> = registry
            .cancel::<(), _>(CancelToken)
            .into_stream()
            .collect()
            .await;

        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_complete_before_cancellation() {
        let registry = CancellationRegistry::new();
        let values: Vec<i32> = Effect::of(1)
            .cancellable(&registry, CancelToken, false)
            .into_stream()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![1]);

        let _: Vec<_> = registry
            .cancel::<(), _>(CancelToken)
            .into_stream()
            .collect()
            .await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_identity_is_noop() {
        let registry = CancellationRegistry::new();
        registry.cancel_now(&CancelId::new("never registered")).await;
        registry.cancel_now(&CancelId::new("never registered")).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_twice_after_one_registration() {
        let registry = CancellationRegistry::new();
        let (_source, values) = mpsc::unbounded::<i32>();
        let (mut rx, task) =
            spawn_collect(Effect::from_stream(values).cancellable(&registry, CancelToken, false));
        settle().await;
        assert_eq!(registry.handle_count(CancelToken), 1);

        let id = CancelId::new(CancelToken);
        registry.cancel_now(&id).await;
        registry.cancel_now(&id).await;

        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
        assert!(!registry.is_registered(CancelToken));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_covers_every_identity() {
        let registry = CancellationRegistry::new();
        let (_a_source, a_values) = mpsc::unbounded::<i32>();
        let (_b_source, b_values) = mpsc::unbounded::<i32>();
        let (_c_source, c_values) = mpsc::unbounded::<i32>();

        let (_a, a_task) =
            spawn_collect(Effect::from_stream(a_values).cancellable(&registry, "a", false));
        let (_b, b_task) =
            spawn_collect(Effect::from_stream(b_values).cancellable(&registry, "b", false));
        let (_c, _c_task) =
            spawn_collect(Effect::from_stream(c_values).cancellable(&registry, "c", false));
        settle().await;
        assert_eq!(registry.len(), 3);

        let _: Vec<_> = registry
            .cancel_all::<(), _, _>(["a", "b"])
            .into_stream()
            .collect()
            .await;

        a_task.await.unwrap();
        b_task.await.unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.is_registered("c"));
        registry.reset();
    }

    #[tokio::test]
    async fn test_cancel_from_inside_a_sweep_reenters_the_gate() {
        let registry = CancellationRegistry::new();
        let (_source, values) = mpsc::unbounded::<i32>();
        let (_rx, task) =
            spawn_collect(Effect::from_stream(values).cancellable(&registry, CancelToken, false));
        settle().await;

        let id = CancelId::new(CancelToken);
        tokio::time::timeout(
            Duration::from_secs(1),
            registry.inner.gate.with_lock(registry.cancel_now(&id)),
        )
        .await
        .expect("nested cancellation deadlocked");

        task.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce() {
        let registry = CancellationRegistry::new();
        let values = Arc::new(Mutex::new(Vec::new()));

        let run = |value: i32| {
            let values = values.clone();
            let effect =
                Effect::of(value).debounce(&registry, "cancel token", Duration::from_secs(1));
            tokio::spawn(async move {
                let mut stream = effect.into_stream();
                while let Some(item) = stream.next().await {
                    values.lock().unwrap().push(item.unwrap());
                }
            });
        };

        run(1);
        assert!(values.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(values.lock().unwrap().is_empty());

        run(2);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(values.lock().unwrap().is_empty());

        run(3);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(values.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(*values.lock().unwrap(), vec![3]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*values.lock().unwrap(), vec![3]);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_is_lazy() {
        let registry = CancellationRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let values = Arc::new(Mutex::new(Vec::new()));

        let counter = runs.clone();
        let effect = Effect::run(move |emitter| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            emitter.emit(1);
            Ok(())
        })
        .debounce(&registry, "cancel token", Duration::from_secs(1));

        let sink = values.clone();
        tokio::spawn(async move {
            let mut stream = effect.into_stream();
            while let Some(item) = stream.next().await {
                sink.lock().unwrap().push(item.unwrap());
            }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(values.lock().unwrap().is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(*values.lock().unwrap(), vec![1]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overtaken_debounced_bodies_never_run() {
        let registry = CancellationRegistry::new();
        let runs: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let values = Arc::new(Mutex::new(Vec::new()));

        let start = |index: usize| {
            let counter = runs[index].clone();
            let effect = Effect::run(move |emitter| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                emitter.emit(index);
                Ok(())
            })
            .debounce(&registry, "search", Duration::from_secs(1));

            let sink = values.clone();
            tokio::spawn(async move {
                let mut stream = effect.into_stream();
                while let Some(item) = stream.next().await {
                    sink.lock().unwrap().push(item.unwrap());
                }
            });
        };

        start(0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        start(1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        start(2);
        tokio::time::sleep(Duration::from_millis(1001)).await;

        assert_eq!(*values.lock().unwrap(), vec![2]);
        assert_eq!(runs[0].load(Ordering::SeqCst), 0);
        assert_eq!(runs[1].load(Ordering::SeqCst), 0);
        assert_eq!(runs[2].load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
