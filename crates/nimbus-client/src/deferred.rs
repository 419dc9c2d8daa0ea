//! Deferred results: the eventual outcome of a remote operation.
//!
//! A [`Deferred`] settles exactly once, to a value or to a [`NimbusError`].
//! Continuations attached before it settles run in attachment order once it
//! does; continuations attached afterwards run immediately, still in order.
//! Handles are cheap to clone and every clone observes the same outcome.
//!
//! ```no_run
//! # async fn demo(client: nimbus_client::Client) -> Result<(), nimbus_client::NimbusError> {
//! use nimbus_client::{Query, RequestOptions};
//!
//! let total = Query::new("GameScore")
//!     .greater_than("score", 1000)
//!     .find(&client, RequestOptions::default())
//!     .then(|records| records.len())
//!     .await?;
//! # let _ = total;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::debug;

use crate::{ErrorCode, NimbusError};

/// Outcome of a deferred result.
pub type Outcome<T> = Result<T, NimbusError>;

type Continuation<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

enum State<T> {
    Pending(VecDeque<Continuation<T>>),
    Settled {
        outcome: Outcome<T>,
        queue: VecDeque<Continuation<T>>,
        draining: bool,
    },
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Shared<T> {
    fn settle(&self, outcome: Outcome<T>) -> Result<(), NimbusError> {
        {
            let mut state = self.lock();
            let queue = match &mut *state {
                State::Settled { .. } => return Err(NimbusError::AlreadyResolved),
                State::Pending(queue) => std::mem::take(queue),
            };
            *state = State::Settled {
                outcome,
                queue,
                draining: true,
            };
        }
        self.drain();
        Ok(())
    }

    fn subscribe(&self, continuation: Continuation<T>) {
        {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(queue) => {
                    queue.push_back(continuation);
                    return;
                }
                State::Settled {
                    queue, draining, ..
                } => {
                    queue.push_back(continuation);
                    if *draining {
                        return;
                    }
                    *draining = true;
                }
            }
        }
        self.drain();
    }

    /// Run queued continuations one at a time, outside the lock.
    fn drain(&self) {
        loop {
            let (continuation, outcome) = {
                let mut state = self.lock();
                let State::Settled {
                    outcome,
                    queue,
                    draining,
                } = &mut *state
                else {
                    return;
                };
                match queue.pop_front() {
                    Some(continuation) => (continuation, outcome.clone()),
                    None => {
                        *draining = false;
                        return;
                    }
                }
            };
            continuation(outcome);
        }
    }
}

/// The eventual outcome of an asynchronous operation.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.lock() {
            State::Pending(_) => "pending",
            State::Settled { outcome: Ok(_), .. } => "resolved",
            State::Settled {
                outcome: Err(_), ..
            } => "rejected",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

/// Write side of a pending [`Deferred`].
///
/// Clones share one settlement. When the last clone is dropped while the
/// deferred result is still pending, it is rejected with
/// [`NimbusError::Abandoned`].
pub struct Resolver<T: Clone> {
    handle: Arc<ResolverHandle<T>>,
}

struct ResolverHandle<T: Clone> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone> Drop for ResolverHandle<T> {
    fn drop(&mut self) {
        if self.shared.settle(Err(NimbusError::Abandoned)).is_ok() {
            debug!("deferred result abandoned by its resolver");
        }
    }
}

impl<T: Clone> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<T: Clone> Resolver<T> {
    /// Settle with a success value.
    pub fn resolve(&self, value: T) -> Result<(), NimbusError> {
        self.handle.shared.settle(Ok(value))
    }

    /// Settle with a failure.
    pub fn reject(&self, error: NimbusError) -> Result<(), NimbusError> {
        self.handle.shared.settle(Err(error))
    }

    /// Settle with an outcome.
    pub fn settle(&self, outcome: Outcome<T>) -> Result<(), NimbusError> {
        self.handle.shared.settle(outcome)
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Create a pending deferred result and the resolver that settles it.
    pub fn pending() -> (Resolver<T>, Deferred<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending(VecDeque::new())),
        });
        let resolver = Resolver {
            handle: Arc::new(ResolverHandle {
                shared: Arc::clone(&shared),
            }),
        };
        (resolver, Deferred { shared })
    }

    /// A deferred result that has already succeeded.
    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// A deferred result that has already failed.
    pub fn rejected(error: NimbusError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(outcome: Outcome<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Settled {
                    outcome,
                    queue: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    /// Drive a future on the current tokio runtime and settle with its output.
    ///
    /// Outside a runtime the result is rejected with `NOT_INITIALIZED`.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                return Self::rejected(NimbusError::invalid(
                    ErrorCode::NotInitialized,
                    "no tokio runtime available to drive the request",
                ));
            }
        };

        let (resolver, deferred) = Self::pending();
        handle.spawn(async move {
            let _ = resolver.settle(future.await);
        });
        deferred
    }

    /// Whether the outcome is still unknown.
    pub fn is_pending(&self) -> bool {
        matches!(&*self.shared.lock(), State::Pending(_))
    }

    /// The outcome, if already settled.
    pub fn peek(&self) -> Option<Outcome<T>> {
        match &*self.shared.lock() {
            State::Pending(_) => None,
            State::Settled { outcome, .. } => Some(outcome.clone()),
        }
    }

    fn subscribe(&self, continuation: impl FnOnce(Outcome<T>) + Send + 'static) {
        self.shared.subscribe(Box::new(continuation));
    }

    fn forward_to(&self, resolver: Resolver<T>) {
        self.subscribe(move |outcome| {
            let _ = resolver.settle(outcome);
        });
    }

    /// Chain a continuation on success. Failures pass through unchanged.
    pub fn then<U, F>(&self, on_success: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (resolver, next) = Deferred::pending();
        self.subscribe(move |outcome| {
            let _ = resolver.settle(outcome.map(on_success));
        });
        next
    }

    /// Chain a continuation that itself produces a deferred result.
    ///
    /// The returned deferred result settles with the inner one's outcome.
    pub fn and_then<U, F>(&self, on_success: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Deferred<U> + Send + 'static,
    {
        let (resolver, next) = Deferred::pending();
        self.subscribe(move |outcome| match outcome {
            Ok(value) => on_success(value).forward_to(resolver),
            Err(error) => {
                let _ = resolver.reject(error);
            }
        });
        next
    }

    /// Chain continuations for both branches.
    pub fn then_or_else<U, F, G>(&self, on_success: F, on_failure: G) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Deferred<U> + Send + 'static,
        G: FnOnce(NimbusError) -> Deferred<U> + Send + 'static,
    {
        let (resolver, next) = Deferred::pending();
        self.subscribe(move |outcome| match outcome {
            Ok(value) => on_success(value).forward_to(resolver),
            Err(error) => on_failure(error).forward_to(resolver),
        });
        next
    }

    /// Chain a continuation on failure. Successes pass through unchanged.
    pub fn or_else<F>(&self, on_failure: F) -> Deferred<T>
    where
        F: FnOnce(NimbusError) -> Deferred<T> + Send + 'static,
    {
        let (resolver, next) = Deferred::pending();
        self.subscribe(move |outcome| match outcome {
            Ok(value) => {
                let _ = resolver.resolve(value);
            }
            Err(error) => on_failure(error).forward_to(resolver),
        });
        next
    }

    /// Replace a failure with a value.
    pub fn recover<F>(&self, on_failure: F) -> Deferred<T>
    where
        F: FnOnce(NimbusError) -> T + Send + 'static,
    {
        self.or_else(move |error| Deferred::resolved(on_failure(error)))
    }

    /// Run a side effect on success.
    pub fn done<F>(&self, callback: F) -> Deferred<T>
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.subscribe(move |outcome| {
            if let Ok(value) = &outcome {
                callback(value);
            }
        });
        self.clone()
    }

    /// Run a side effect on failure.
    pub fn fail<F>(&self, callback: F) -> Deferred<T>
    where
        F: FnOnce(&NimbusError) + Send + 'static,
    {
        self.subscribe(move |outcome| {
            if let Err(error) = &outcome {
                callback(error);
            }
        });
        self.clone()
    }

    /// Run a side effect whichever way the result settles.
    pub fn always<F>(&self, callback: F) -> Deferred<T>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.subscribe(move |outcome| callback(&outcome));
        self.clone()
    }

    /// Attach legacy `success`/`error` hooks.
    pub fn with_callbacks(&self, callbacks: Callbacks<T>) -> Deferred<T> {
        let Callbacks { success, error } = callbacks;
        self.always(move |outcome| match outcome {
            Ok(value) => {
                if let Some(success) = success {
                    success(value);
                }
            }
            Err(e) => {
                if let Some(error) = error {
                    error(e);
                }
            }
        })
    }

    /// Wait for every deferred result to succeed.
    ///
    /// Values keep input order. The first failure settles the combined
    /// result immediately without waiting for the rest.
    pub fn all<I>(items: I) -> Deferred<Vec<T>>
    where
        I: IntoIterator<Item = Deferred<T>>,
    {
        let items: Vec<Deferred<T>> = items.into_iter().collect();
        if items.is_empty() {
            return Deferred::resolved(Vec::new());
        }

        let (resolver, combined) = Deferred::pending();
        let slots: Arc<Mutex<(Vec<Option<T>>, usize)>> =
            Arc::new(Mutex::new((vec![None; items.len()], items.len())));

        for (index, item) in items.into_iter().enumerate() {
            let resolver = resolver.clone();
            let slots = Arc::clone(&slots);
            item.subscribe(move |outcome| match outcome {
                Ok(value) => {
                    let finished = {
                        let mut guard = slots.lock().unwrap_or_else(PoisonError::into_inner);
                        let (values, remaining) = &mut *guard;
                        values[index] = Some(value);
                        *remaining -= 1;
                        if *remaining == 0 {
                            Some(values.drain(..).flatten().collect::<Vec<T>>())
                        } else {
                            None
                        }
                    };
                    if let Some(values) = finished {
                        let _ = resolver.resolve(values);
                    }
                }
                Err(error) => {
                    let _ = resolver.reject(error);
                }
            });
        }

        combined
    }
}

/// Legacy completion hooks, attached with [`Deferred::with_callbacks`].
pub struct Callbacks<T> {
    success: Option<Box<dyn FnOnce(&T) + Send>>,
    error: Option<Box<dyn FnOnce(&NimbusError) + Send>>,
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self {
            success: None,
            error: None,
        }
    }
}

impl<T> Callbacks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook called with the success value.
    pub fn success(mut self, callback: impl FnOnce(&T) + Send + 'static) -> Self {
        self.success = Some(Box::new(callback));
        self
    }

    /// Hook called with the failure.
    pub fn error(mut self, callback: impl FnOnce(&NimbusError) + Send + 'static) -> Self {
        self.error = Some(Box::new(callback));
        self
    }
}

/// Future returned by awaiting a [`Deferred`].
pub struct DeferredFuture<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> Future for DeferredFuture<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(NimbusError::Abandoned)))
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Deferred<T> {
    type Output = Outcome<T>;
    type IntoFuture = DeferredFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        let (tx, rx) = oneshot::channel();
        self.subscribe(move |outcome| {
            let _ = tx.send(outcome);
        });
        DeferredFuture { rx }
    }
}
