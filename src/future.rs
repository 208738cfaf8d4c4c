//! Blocking single-assignment futures.
//!
//! [`Promise`] is the write side, [`Future`] the exclusive read side and
//! [`SharedFuture`] a cloneable read side. A future either waits for a
//! promise or carries a deferred job that the first waiter runs.
//!
//! Both read sides can be blocked on (`get`, `wait`, `wait_for`) or awaited,
//! so results produced on the loop thread can be consumed from plain threads
//! and from any executor alike.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::Error;

pub(crate) type Job<T> = Box<dyn FnOnce() -> Result<T, Error> + Send>;

/// Outcome of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    Ready,
    Timeout,
    /// The future holds a deferred job nobody has started; waiting with a
    /// timeout does not start it.
    Deferred,
}

enum State<T> {
    Deferred(Job<T>),
    Running,
    Pending,
    Ready(Result<T, Error>),
    Taken,
}

impl<T> State<T> {
    fn is_unresolved(&self) -> bool {
        matches!(self, State::Running | State::Pending)
    }
}

struct Inner<T> {
    state: State<T>,
    wakers: Vec<Waker>,
}

/// State shared by a promise and every future reading from it.
pub(crate) struct Shared<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn with_state(state: State<T>) -> Arc<Self> {
        Arc::new(Shared {
            inner: Mutex::new(Inner {
                state,
                wakers: Vec::new(),
            }),
            ready: Condvar::new(),
        })
    }

    /// Store the result. Only the first completion counts.
    fn complete(&self, result: Result<T, Error>) -> bool {
        let wakers = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.state.is_unresolved() {
                return false;
            }
            inner.state = State::Ready(result);
            mem::take(&mut inner.wakers)
        };
        self.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Run the deferred job if it has not been started. No-op otherwise.
    fn run_deferred(&self) {
        let job = {
            let mut inner = self.inner.lock().unwrap();
            match mem::replace(&mut inner.state, State::Running) {
                State::Deferred(job) => job,
                other => {
                    inner.state = other;
                    return;
                }
            }
        };
        let result = catch(job).and_then(|r| r);
        self.complete(result);
    }

    /// Block until a result is stored, running a deferred job inline.
    fn wait(&self) -> MutexGuard<'_, Inner<T>> {
        self.run_deferred();
        let mut inner = self.inner.lock().unwrap();
        while inner.state.is_unresolved() {
            inner = self.ready.wait(inner).unwrap();
        }
        inner
    }

    fn wait_for(&self, timeout: Duration) -> FutureStatus {
        let inner = self.inner.lock().unwrap();
        if matches!(inner.state, State::Deferred(_)) {
            return FutureStatus::Deferred;
        }
        let (inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |i| i.state.is_unresolved())
            .unwrap();
        if inner.state.is_unresolved() {
            FutureStatus::Timeout
        } else {
            FutureStatus::Ready
        }
    }

    fn is_ready(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().state,
            State::Ready(_) | State::Taken
        )
    }

    /// Poll for a resolved state; `read` extracts the output from it.
    fn poll_with<R>(
        &self,
        cx: &mut Context<'_>,
        read: impl FnOnce(&mut State<T>) -> R,
    ) -> Poll<R> {
        self.run_deferred();
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_unresolved() {
            if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                inner.wakers.push(cx.waker().clone());
            }
            return Poll::Pending;
        }
        Poll::Ready(read(&mut inner.state))
    }
}

fn take<T>(state: &mut State<T>) -> Result<T, Error> {
    match mem::replace(state, State::Taken) {
        State::Ready(result) => result,
        _ => Err(Error::AlreadyRetrieved),
    }
}

fn peek<T: Clone>(state: &State<T>) -> Result<T, Error> {
    match state {
        State::Ready(result) => result.clone(),
        _ => Err(Error::AlreadyRetrieved),
    }
}

/// Run `f`, turning a panic into [`Error::Panicked`].
pub(crate) fn catch<R>(f: impl FnOnce() -> R) -> Result<R, Error> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Error::from_panic)
}

// ── Promise ─────────────────────────────────────────────────────────

/// Write side of a future. Dropping it unfulfilled stores
/// [`Error::BrokenPromise`].
pub struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// A connected promise / future pair.
pub fn promise<T>() -> (Promise<T>, Future<T>) {
    let shared = Shared::with_state(State::Pending);
    (
        Promise {
            shared: Some(shared.clone()),
        },
        Future { shared },
    )
}

impl<T> Promise<T> {
    pub fn set_value(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn set_error(self, error: Error) {
        self.complete(Err(error));
    }

    pub fn complete(mut self, result: Result<T, Error>) {
        if let Some(shared) = self.shared.take() {
            shared.complete(result);
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(Error::BrokenPromise));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

// ── Future ──────────────────────────────────────────────────────────

/// Exclusive read side. `get` consumes it.
#[must_use = "futures hold results and errors; dropping one discards them"]
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Future<T> {
    /// A future whose value is produced by `job` on first wait.
    pub(crate) fn deferred(job: Job<T>) -> Self {
        Future {
            shared: Shared::with_state(State::Deferred(job)),
        }
    }

    /// Block until the result is available and take it.
    pub fn get(self) -> Result<T, Error> {
        let mut inner = self.shared.wait();
        take(&mut inner.state)
    }

    /// Block until the result is available.
    pub fn wait(&self) {
        drop(self.shared.wait());
    }

    pub fn wait_for(&self, timeout: Duration) -> FutureStatus {
        self.shared.wait_for(timeout)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Convert into a cloneable future observing the same result.
    pub fn share(self) -> SharedFuture<T> {
        SharedFuture {
            shared: self.shared,
        }
    }
}

impl<T> std::future::Future for Future<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.poll_with(cx, take)
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// A future already holding `value`.
pub fn make_ready_future<T>(value: T) -> Future<T> {
    Future {
        shared: Shared::with_state(State::Ready(Ok(value))),
    }
}

/// A future already holding `error`.
pub fn make_error_future<T>(error: Error) -> Future<T> {
    Future {
        shared: Shared::with_state(State::Ready(Err(error))),
    }
}

// ── SharedFuture ────────────────────────────────────────────────────

/// Cloneable read side; every clone observes the same completion.
#[must_use = "futures hold results and errors; dropping one discards them"]
pub struct SharedFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        SharedFuture {
            shared: self.shared.clone(),
        }
    }
}

impl<T> SharedFuture<T> {
    /// Block until the result is available and return a copy of it.
    pub fn get(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        let inner = self.shared.wait();
        peek(&inner.state)
    }

    /// Block until the result is available and hand `f` a reference to the
    /// value. Needs no `Clone`; an error is returned as a copy.
    ///
    /// `f` runs while the result is locked and must not wait on this future.
    pub fn with<U>(&self, f: impl FnOnce(&T) -> U) -> Result<U, Error> {
        let inner = self.shared.wait();
        match &inner.state {
            State::Ready(Ok(value)) => Ok(f(value)),
            State::Ready(Err(e)) => Err(e.clone()),
            _ => Err(Error::AlreadyRetrieved),
        }
    }

    pub fn wait(&self) {
        drop(self.shared.wait());
    }

    pub fn wait_for(&self, timeout: Duration) -> FutureStatus {
        self.shared.wait_for(timeout)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }
}

impl<T: Clone> std::future::Future for SharedFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.poll_with(cx, |state| peek(state))
    }
}

impl<T> fmt::Debug for SharedFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}
