//! Continuations on futures.
//!
//! [`then`] attaches a function to a future and returns a future of its
//! result. [`then_flatten`] does the same for functions that themselves
//! return pending work, unwrapping every nested layer before the result is
//! stored.
//!
//! Chain setup never blocks. Waiting on the source happens inside the job,
//! which runs either inline on the first waiter ([`Launch::Deferred`]) or on
//! a background thread ([`Launch::Async`]).

use std::sync::{Arc, Mutex};
use std::thread;

use tracing::warn;

use crate::error::Error;
use crate::future::{catch, promise, Future, SharedFuture};

/// Where a continuation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Launch {
    /// On the first thread that waits for the result.
    Deferred,
    /// On a dedicated background thread, started immediately.
    Async,
    /// Async when a thread can be started, deferred otherwise.
    #[default]
    Any,
}

/// Something a continuation can wait on.
pub trait Source: Send + 'static {
    type Output: Send + 'static;

    /// Block until the source completes.
    fn wait_value(self) -> Result<Self::Output, Error>;
}

impl<T: Send + 'static> Source for Future<T> {
    type Output = T;

    fn wait_value(self) -> Result<T, Error> {
        self.get()
    }
}

impl<T: Clone + Send + 'static> Source for SharedFuture<T> {
    type Output = T;

    fn wait_value(self) -> Result<T, Error> {
        self.get()
    }
}

/// Run `job` under `policy` and return a future of its result.
fn launch_job<T, J>(policy: Launch, job: J) -> Future<T>
where
    T: Send + 'static,
    J: FnOnce() -> Result<T, Error> + Send + 'static,
{
    if policy == Launch::Deferred {
        return Future::deferred(Box::new(job));
    }

    let (promise, future) = promise();
    // Taken back if the thread never starts.
    let slot = Arc::new(Mutex::new(Some(job)));
    let queued = slot.clone();
    let spawned = thread::Builder::new()
        .name("tether-then".into())
        .spawn(move || {
            let job = queued.lock().unwrap().take();
            if let Some(job) = job {
                promise.complete(catch(job).and_then(|r| r));
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to start continuation thread; running deferred");
        let job = slot.lock().unwrap().take();
        if let Some(job) = job {
            return Future::deferred(Box::new(job));
        }
    }
    future
}

/// Run `f` under `policy`. A panic in `f` becomes [`Error::Panicked`].
pub fn launch<T, F>(policy: Launch, f: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    launch_job(policy, move || catch(f))
}

/// A future of `f(value)` once `source` completes.
///
/// An error from `source` is stored in the result and `f` is not called.
pub fn then<S, U, F>(source: S, f: F, policy: Launch) -> Future<U>
where
    S: Source,
    U: Send + 'static,
    F: FnOnce(S::Output) -> U + Send + 'static,
{
    launch_job(policy, move || {
        let value = source.wait_value()?;
        catch(move || f(value))
    })
}

/// Like [`then`], for continuations returning pending work.
///
/// Whatever `f` returns is converted into a [`Step`] and resolved until a
/// plain value comes out. `Future<T>`, `SharedFuture<T>`, futures of
/// futures up to three levels and `Future<Step<T>>` convert directly; a
/// hand-built [`Step`] chain flattens at any depth.
pub fn then_flatten<S, U, N, F>(source: S, f: F, policy: Launch) -> Future<U>
where
    S: Source,
    U: Send + 'static,
    N: Into<Step<U>>,
    F: FnOnce(S::Output) -> N + Send + 'static,
{
    launch_job(policy, move || {
        let value = source.wait_value()?;
        let step = catch(move || f(value).into())?;
        step.resolve()
    })
}

/// A value, or a future of the next step towards it.
pub enum Step<T> {
    Ready(T),
    Pending(Future<Step<T>>),
}

impl<T> Step<T> {
    /// Wait through every pending layer.
    pub fn resolve(self) -> Result<T, Error> {
        let mut step = self;
        loop {
            match step {
                Step::Ready(value) => return Ok(value),
                Step::Pending(next) => step = next.get()?,
            }
        }
    }
}

impl<T: Send + 'static> From<Future<T>> for Step<T> {
    fn from(future: Future<T>) -> Self {
        Step::Pending(launch_job(Launch::Deferred, move || {
            future.get().map(Step::Ready)
        }))
    }
}

impl<T: Clone + Send + 'static> From<SharedFuture<T>> for Step<T> {
    fn from(future: SharedFuture<T>) -> Self {
        Step::Pending(launch_job(Launch::Deferred, move || {
            future.get().map(Step::Ready)
        }))
    }
}

impl<T: Send + 'static> From<Future<Step<T>>> for Step<T> {
    fn from(future: Future<Step<T>>) -> Self {
        Step::Pending(future)
    }
}

impl<T: Send + 'static> From<Future<Future<T>>> for Step<T> {
    fn from(future: Future<Future<T>>) -> Self {
        Step::Pending(launch_job(Launch::Deferred, move || Ok(future.get()?.into())))
    }
}

impl<T: Send + 'static> From<Future<Future<Future<T>>>> for Step<T> {
    fn from(future: Future<Future<Future<T>>>) -> Self {
        Step::Pending(launch_job(Launch::Deferred, move || Ok(future.get()?.into())))
    }
}

impl<T: Clone + Send + 'static> From<Future<SharedFuture<T>>> for Step<T> {
    fn from(future: Future<SharedFuture<T>>) -> Self {
        Step::Pending(launch_job(Launch::Deferred, move || Ok(future.get()?.into())))
    }
}

impl<T: Clone + Send + 'static> From<SharedFuture<SharedFuture<T>>> for Step<T> {
    fn from(future: SharedFuture<SharedFuture<T>>) -> Self {
        Step::Pending(launch_job(Launch::Deferred, move || Ok(future.get()?.into())))
    }
}

impl<T: Send + 'static> Future<Step<T>> {
    /// Collapse a hand-built chain of steps into a plain future.
    pub fn flatten(self) -> Future<T> {
        launch_job(Launch::Deferred, move || self.get()?.resolve())
    }
}

impl<T: Send + 'static> Future<Future<T>> {
    /// Unwrap one level of nesting, e.g. to use the result as a source.
    pub fn flatten(self) -> Future<T> {
        launch_job(Launch::Deferred, move || self.get()?.get())
    }
}

impl<T: Send + 'static> Future<T> {
    /// [`then`] with the default launch policy.
    pub fn then<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        then(self, f, Launch::default())
    }

    pub fn then_with<U, F>(self, policy: Launch, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        then(self, f, policy)
    }

    /// [`then_flatten`] with the default launch policy.
    pub fn then_flatten<U, N, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        N: Into<Step<U>>,
        F: FnOnce(T) -> N + Send + 'static,
    {
        then_flatten(self, f, Launch::default())
    }
}

impl<T: Clone + Send + 'static> SharedFuture<T> {
    /// [`then`] on a copy of this handle; other clones are unaffected.
    pub fn then<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        then(self.clone(), f, Launch::default())
    }

    pub fn then_flatten<U, N, F>(&self, f: F) -> Future<U>
    where
        U: Send + 'static,
        N: Into<Step<U>>,
        F: FnOnce(T) -> N + Send + 'static,
    {
        then_flatten(self.clone(), f, Launch::default())
    }
}

impl<T: Send + 'static> SharedFuture<T> {
    /// [`then`] for results that are not `Clone`: `f` borrows the value.
    pub fn then_ref<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let source = self.clone();
        launch_job(Launch::default(), move || source.with(|value| catch(|| f(value)))?)
    }
}
