//! Reactor-side halves of a wake handle.
//!
//! A continuation is what the trampoline finds in a handle's user-data block.
//! The block is untyped, so continuations live behind [`Continuation`] and are
//! cast back to their concrete type only by the `Async` that created them.

use std::any::Any;
use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use crate::async_handle::Async;
use crate::error::{Error, HandleState};
use crate::future::{catch, promise, Future, Promise, SharedFuture};
use crate::handle::OwnerRef;

pub(crate) trait Continuation: Send + Sync + 'static {
    /// Run on the loop thread. `owner` is the `this` pointer of the block
    /// the continuation was found in.
    fn dispatch(&self, owner: *const ());

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

type Handler<P, R> = Box<dyn FnMut(&Async<P, R>, P) -> R + Send>;

/// The payload of the latest `send` and the promise for its result.
struct Mailbox<P, R> {
    payload: P,
    promise: Promise<R>,
}

/// A registered handler plus its single-slot mailbox.
pub(crate) struct AsyncContinuation<P, R> {
    handler: Mutex<Handler<P, R>>,
    mailbox: Mutex<Option<Mailbox<P, R>>>,
}

impl<P, R> AsyncContinuation<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: FnMut(&Async<P, R>, P) -> R + Send + 'static,
    {
        AsyncContinuation {
            handler: Mutex::new(Box::new(handler)),
            mailbox: Mutex::new(None),
        }
    }

    /// Store `payload` for the next dispatch. A payload still waiting in the
    /// mailbox is replaced and its future fails with [`Error::Superseded`].
    pub(crate) fn init(&self, payload: P) -> Future<R> {
        let (promise, future) = promise();
        let displaced = self
            .mailbox
            .lock()
            .unwrap()
            .replace(Mailbox { payload, promise });
        if let Some(old) = displaced {
            warn!("payload replaced before dispatch");
            old.promise.set_error(Error::Superseded);
        }
        future
    }
}

impl<P, R> Continuation for AsyncContinuation<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn dispatch(&self, owner: *const ()) {
        let Some(Mailbox { payload, promise }) = self.mailbox.lock().unwrap().take() else {
            // Already consumed by an earlier wake.
            trace!("wake with empty mailbox");
            return;
        };
        // SAFETY: `owner` is the `this` of an `Async<P, R>` block; the block
        // holds a weak reference for as long as it exists.
        let Some(handle) = (unsafe { OwnerRef::upgrade::<Async<P, R>>(owner) }) else {
            return;
        };

        let result = {
            let mut handler = self.handler.lock().unwrap();
            catch(|| (*handler)(&*handle, payload))
        };
        promise.complete(result);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

type OnClose<P, R> = Box<dyn FnOnce(&Async<P, R>) + Send>;

/// Runs once, when the loop completes a deferred close.
pub(crate) struct CloseContinuation<P, R> {
    on_close: Mutex<Option<OnClose<P, R>>>,
    promise: Mutex<Option<Promise<()>>>,
    /// Keeps the handle alive until the loop is done with it.
    keepalive: Mutex<Option<Arc<Async<P, R>>>>,
}

impl<P, R> CloseContinuation<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new<F>(handle: Arc<Async<P, R>>, on_close: F) -> (Self, SharedFuture<()>)
    where
        F: FnOnce(&Async<P, R>) + Send + 'static,
    {
        let (promise, future) = promise();
        let continuation = CloseContinuation {
            on_close: Mutex::new(Some(Box::new(on_close))),
            promise: Mutex::new(Some(promise)),
            keepalive: Mutex::new(Some(handle)),
        };
        (continuation, future.share())
    }
}

impl<P, R> Continuation for CloseContinuation<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn dispatch(&self, _owner: *const ()) {
        let Some(handle) = self.keepalive.lock().unwrap().take() else {
            return;
        };
        handle.set_state(HandleState::Closed);

        let result = match self.on_close.lock().unwrap().take() {
            Some(on_close) => catch(|| on_close(&*handle)),
            None => Ok(()),
        };
        // In-flight sends will never be dispatched now.
        handle.take_continuation();
        if let Some(promise) = self.promise.lock().unwrap().take() {
            promise.complete(result);
        }
        // Last: this may free the handle's raw allocations.
        drop(handle);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn init_replaces_pending_payload() {
        let continuation = AsyncContinuation::<u32, u32>::new(|_, v| v);
        let first = continuation.init(1);
        let second = continuation.init(2);
        assert_eq!(first.get(), Err(Error::Superseded));
        assert!(!second.is_ready());

        let mailbox = continuation.mailbox.lock().unwrap().take().unwrap();
        assert_eq!(mailbox.payload, 2);
    }

    #[test]
    fn empty_dispatch_is_a_no_op() {
        let continuation = AsyncContinuation::<(), ()>::new(|_, ()| unreachable!());
        continuation.dispatch(ptr::null());
    }

    #[test]
    fn dropping_continuation_breaks_pending_future() {
        let continuation = AsyncContinuation::<u8, u8>::new(|_, v| v);
        let future = continuation.init(3);
        drop(continuation);
        assert_eq!(future.get(), Err(Error::BrokenPromise));
    }

    #[test]
    fn downcast_recovers_concrete_type() {
        let erased: Arc<dyn Continuation> =
            Arc::new(AsyncContinuation::<i32, String>::new(|_, v| v.to_string()));
        assert!(erased.clone().as_any().downcast::<AsyncContinuation<i32, String>>().is_ok());
        assert!(erased.as_any().downcast::<AsyncContinuation<i32, i32>>().is_err());
    }
}
