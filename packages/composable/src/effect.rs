//! Effects: cold, asynchronous sequences of follow-up values.
//!
//! An [`Effect`] describes work, it does not perform it. Nothing runs until
//! the store (or a test) starts polling the sequence, which makes effects
//! safe to build inside pure reducers and to discard without side effects.
//!
//! # Key Properties
//!
//! - **Cold**: constructors capture work lazily; bodies run on first poll
//! - **Possibly infinite**: an effect may emit forever until cancelled
//! - **Failures are values**: an `Err` item terminates the running effect
//!   and is routed to the store's [`EffectErrorPolicy`](crate::EffectErrorPolicy)
//!
//! # Example
//!
//! ```ignore
//! use composable::Effect;
//! use std::time::Duration;
//!
//! let refresh = Effect::run(|emitter| async move {
//!     tokio::time::sleep(Duration::from_millis(100)).await;
//!     emitter.emit(Action::Refreshed);
//!     Ok(())
//! });
//!
//! let both = Effect::concatenate([Effect::of(Action::Loading), refresh]);
//! ```

use std::fmt;
use std::future::Future;

use futures::channel::mpsc::{self, UnboundedSender};
use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};

/// A lazily evaluated asynchronous sequence of `T` values.
pub struct Effect<T> {
    stream: BoxStream<'static, anyhow::Result<T>>,
    /// Known to produce nothing; the store skips spawning these.
    empty: bool,
}

impl<T: Send + 'static> Effect<T> {
    /// An effect that completes immediately without output.
    pub fn none() -> Self {
        Self {
            stream: stream::empty().boxed(),
            empty: true,
        }
    }

    /// An effect that emits a single value.
    pub fn of(value: T) -> Self {
        Self::from_raw(stream::once(future::ready(Ok(value))).boxed())
    }

    /// An effect that emits every value of `values`, in order.
    pub fn of_all<I>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_raw(stream::iter(values.into_iter().map(Ok)).boxed())
    }

    /// An effect driven by an async body that emits through an [`Emitter`].
    ///
    /// The body is not invoked until the effect is first polled. Returning
    /// `Err` terminates the effect after every value emitted so far.
    ///
    /// ```ignore
    /// Effect::run(|emitter| async move {
    ///     for page in client.pages().await? {
    ///         emitter.emit(Action::PageLoaded(page));
    ///     }
    ///     Ok(())
    /// })
    /// ```
    pub fn run<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Emitter<T>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded();
        let failures = tx.clone();
        let driver = stream::once(async move {
            if let Err(err) = body(Emitter { tx }).await {
                let _ = failures.unbounded_send(Err(err));
            }
        })
        .filter_map(|()| future::ready(None::<anyhow::Result<T>>));

        Self::from_raw(stream::select(driver, rx).boxed())
    }

    /// An effect that emits the output of a single future.
    pub fn future<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::from_raw(stream::once(fut).map(Ok).boxed())
    }

    /// An effect that emits the output of a single fallible future.
    pub fn try_future<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::from_raw(stream::once(fut).boxed())
    }

    /// Wrap an existing stream as an effect.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::from_raw(stream.map(Ok).boxed())
    }

    /// Wrap a stream of fallible values. The first `Err` ends the effect.
    pub fn try_from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<T>> + Send + 'static,
    {
        Self::from_raw(stream.boxed())
    }

    /// An effect that fails as soon as it is started.
    pub fn fail(error: impl Into<anyhow::Error>) -> Self {
        let error = error.into();
        Self::from_raw(stream::once(future::ready(Err(error))).boxed())
    }

    /// Run `work` for its side effect only. Emits no values.
    ///
    /// `work` is called on first poll, never at construction.
    pub fn fire_and_forget<F, Fut>(work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::from_raw(
            stream::once(async move { work().await })
                .filter_map(|()| future::ready(None::<anyhow::Result<T>>))
                .boxed(),
        )
    }

    /// Run effects strictly one after another, flattening their output in
    /// submission order.
    pub fn concatenate<I>(effects: I) -> Self
    where
        I: IntoIterator<Item = Effect<T>>,
    {
        let mut effects: Vec<Effect<T>> = effects.into_iter().filter(|e| !e.empty).collect();
        match effects.len() {
            0 => Self::none(),
            1 => effects.pop().unwrap_or_else(Self::none),
            _ => Self::from_raw(
                stream::iter(effects.into_iter().map(|e| e.stream))
                    .flatten()
                    .boxed(),
            ),
        }
    }

    /// Run effects concurrently, interleaving output as it is produced.
    pub fn merge<I>(effects: I) -> Self
    where
        I: IntoIterator<Item = Effect<T>>,
    {
        let mut effects: Vec<Effect<T>> = effects.into_iter().filter(|e| !e.empty).collect();
        match effects.len() {
            0 => Self::none(),
            1 => effects.pop().unwrap_or_else(Self::none),
            _ => Self::from_raw(stream::select_all(effects.into_iter().map(|e| e.stream)).boxed()),
        }
    }

    /// Run `next` after this effect completes.
    pub fn then(self, next: Effect<T>) -> Self {
        Self::concatenate([self, next])
    }

    /// Transform every emitted value.
    pub fn map<U, F>(self, mut f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        if self.empty {
            return Effect::none();
        }
        Effect::from_raw(self.stream.map(move |item| item.map(&mut f)).boxed())
    }

    /// Drop every emitted value, keeping the work and its failures.
    ///
    /// Useful to hand a value-less effect (cancellation, teardown) to a
    /// reducer with a different action type.
    pub fn ignore_output<U: Send + 'static>(self) -> Effect<U> {
        if self.empty {
            return Effect::none();
        }
        Effect::from_raw(
            self.stream
                .filter_map(|item| future::ready(item.err().map(Err)))
                .boxed(),
        )
    }

    /// Whether this effect is statically known to produce nothing.
    pub fn is_none(&self) -> bool {
        self.empty
    }

    /// Consume the effect into its underlying stream.
    pub fn into_stream(self) -> BoxStream<'static, anyhow::Result<T>> {
        self.stream
    }

    pub(crate) fn from_raw(stream: BoxStream<'static, anyhow::Result<T>>) -> Self {
        Self {
            stream,
            empty: false,
        }
    }

    /// Create a guard when the effect starts; drop it when the effect
    /// completes, fails, or is dropped mid-flight.
    #[cfg(any(test, feature = "testing"))]
    pub(crate) fn guarded<G, F>(self, start: F) -> Self
    where
        G: Send + 'static,
        F: FnOnce() -> G + Send + 'static,
    {
        if self.empty {
            return self;
        }
        let inner = self.stream;
        Self::from_raw(
            stream::once(async move {
                let guard = start();
                inner.map(move |item| {
                    let _held = &guard;
                    item
                })
            })
            .flatten()
            .boxed(),
        )
    }
}

impl<T, E> Effect<Result<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Transform successful values, passing failures through.
    pub fn map_ok<U, F>(self, mut f: F) -> Effect<Result<U, E>>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.map(move |result| result.map(&mut f))
    }

    /// Observe successful values without changing them.
    pub fn inspect_ok<F>(self, mut f: F) -> Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.map(move |result| {
            if let Ok(value) = &result {
                f(value);
            }
            result
        })
    }

    /// Chain a follow-up effect onto every success, in order.
    pub fn and_then_ok<U, F>(self, mut f: F) -> Effect<Result<U, E>>
    where
        U: Send + 'static,
        F: FnMut(T) -> Effect<Result<U, E>> + Send + 'static,
    {
        if self.empty {
            return Effect::none();
        }
        Effect::from_raw(
            self.stream
                .flat_map(move |item| match item {
                    Ok(Ok(value)) => f(value).stream,
                    Ok(Err(err)) => stream::once(future::ready(Ok(Err(err)))).boxed(),
                    Err(err) => stream::once(future::ready(Err(err))).boxed(),
                })
                .boxed(),
        )
    }
}

impl<T> fmt::Debug for Effect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("empty", &self.empty)
            .finish_non_exhaustive()
    }
}

/// Sending half handed to [`Effect::run`] bodies.
pub struct Emitter<T> {
    tx: UnboundedSender<anyhow::Result<T>>,
}

impl<T> Emitter<T> {
    /// Emit a value. Returns `false` once the effect has been cancelled or
    /// dropped, at which point the body should stop.
    pub fn emit(&self, value: T) -> bool {
        self.tx.unbounded_send(Ok(value)).is_ok()
    }

    /// Whether the consuming side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("closed", &self.is_closed())
            .finish()
    }
}
