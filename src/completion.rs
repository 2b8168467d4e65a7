//! One-shot completion handles.
//!
//! A [`Completion`] is handed out when a stage starts and resolves once the stage (and
//! everything upstream of it) has finished. It can be waited on from a thread, polled as
//! a [`Future`], or given a continuation with [`Completion::on_complete`].

use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

type Continuation<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

struct State<T> {
    result: Option<Result<T>>,
    resolved: bool,
    waker: Option<Waker>,
    continuation: Option<Continuation<T>>,
}

impl<T> State<T> {
    /// The outcome, once resolved. A completion already polled to `Ready` reports
    /// `Cancelled` from then on.
    fn take_outcome(&mut self) -> Option<Result<T>> {
        match self.result.take() {
            Some(result) => Some(result),
            None if self.resolved => Some(Err(PipelineError::Cancelled)),
            None => None,
        }
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Create a connected resolver/handle pair
pub(crate) fn pair<T>() -> (CompletionSource<T>, Completion<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            result: None,
            resolved: false,
            waker: None,
            continuation: None,
        }),
        ready: Condvar::new(),
    });
    (
        CompletionSource {
            shared: Arc::clone(&shared),
        },
        Completion { shared },
    )
}

/// The resolving half of a completion. Resolved at most once.
pub(crate) struct CompletionSource<T> {
    shared: Arc<Shared<T>>,
}

impl<T> CompletionSource<T> {
    pub(crate) fn resolve(self, result: Result<T>) {
        self.set(result);
    }

    fn set(&self, result: Result<T>) {
        let mut state = self.shared.state.lock();
        if state.resolved {
            return;
        }
        state.resolved = true;

        if let Some(continuation) = state.continuation.take() {
            drop(state);
            continuation(result);
            return;
        }

        state.result = Some(result);
        let waker = state.waker.take();
        drop(state);

        self.shared.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for CompletionSource<T> {
    fn drop(&mut self) {
        // A resolver that goes away unresolved must not strand its waiters
        self.set(Err(PipelineError::Cancelled));
    }
}

/// Handle to the eventual outcome of a stage or chain.
///
/// Resolves to `Ok` on success, to `Err(PipelineError::Cancelled)` when cancelled and to
/// any other error when a stage faulted.
#[must_use = "a completion does nothing unless waited on"]
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Completion<T> {
    /// A completion that is already resolved
    pub fn ready(result: Result<T>) -> Self {
        let (source, completion) = pair();
        source.resolve(result);
        completion
    }

    /// Whether the outcome is available
    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().resolved
    }

    /// Block the calling thread until the outcome is available
    pub fn wait(self) -> Result<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = state.take_outcome() {
                return result;
            }
            self.shared.ready.wait(&mut state);
        }
    }

    /// Block for at most `timeout`; hands the completion back if it is still pending
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = state.take_outcome() {
                return Ok(result);
            }
            if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                if let Some(result) = state.take_outcome() {
                    return Ok(result);
                }
                drop(state);
                return Err(self);
            }
        }
    }

    /// Run `continuation` with the outcome.
    ///
    /// Runs immediately on the calling thread if already resolved, otherwise on the
    /// thread that resolves the completion.
    pub fn on_complete<F>(self, continuation: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if let Some(result) = state.take_outcome() {
            drop(state);
            continuation(result);
            return;
        }
        state.continuation = Some(Box::new(continuation));
    }

    /// Transform the successful value once it is available
    pub fn map<U, F>(self, f: F) -> Completion<U>
    where
        T: 'static,
        U: Send + 'static,
        F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
    {
        let (source, mapped) = pair();
        self.on_complete(move |result| source.resolve(f(result)));
        mapped
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        match state.take_outcome() {
            Some(result) => Poll::Ready(result),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("complete", &self.is_complete())
            .finish()
    }
}
