//! The user-facing wake handle.

use std::fmt;
use std::marker::PhantomData;
use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use tether_rt::{ffi, is_any, Loop, RawAsync};
use tracing::{debug, error};

use crate::continuation::{AsyncContinuation, CloseContinuation, Continuation};
use crate::error::{check, Error, HandleState};
use crate::future::{catch, make_error_future, make_ready_future, Future, SharedFuture};
use crate::handle::{async_trampoline, close_trampoline, HandleData, OwnerRef};

/// Lets any thread hand a payload to a handler running on the loop thread,
/// and get a future of the handler's result back.
///
/// ```no_run
/// use tether::{Async, Loop, RunMode};
///
/// let lp = Loop::new()?;
/// let doubler = Async::<i32, i32>::new(&lp);
/// doubler.start(|x| x * 2)?;
///
/// let answer = doubler.send(21)?;
/// lp.run(RunMode::NoWait)?;
/// assert_eq!(answer.get()?, 42);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// # Coalescing
///
/// The handle holds one payload at a time. Several sends before the loop
/// gets to the handle result in a single handler call with the latest
/// payload; the earlier futures fail with [`Error::Superseded`]. Callers who
/// need every payload delivered should queue them themselves.
///
/// # Teardown
///
/// Close or stop the handle on the loop thread before letting go of it. An
/// armed handle dropped on the loop thread (or while the loop is idle) stops
/// itself. Dropping one from another thread while the loop is running leaks
/// its loop-side allocations and trips a debug assertion.
pub struct Async<P = (), R = ()> {
    lp: Arc<Loop>,
    raw: NonNull<RawAsync>,
    data: NonNull<HandleData>,
    state: AtomicU8,
    _marker: PhantomData<fn(P) -> R>,
}

// SAFETY: `raw` is only mutated through the loop's own synchronization and
// `data` only through its mutexes.
unsafe impl<P, R> Send for Async<P, R> {}
unsafe impl<P, R> Sync for Async<P, R> {}

impl<P, R> Async<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// A handle bound to `lp`, not yet armed.
    pub fn new(lp: &Arc<Loop>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let data = NonNull::from(Box::leak(Box::new(HandleData::new(OwnerRef::new(
                weak.clone(),
            )))));
            let mut raw = Box::new(RawAsync::new());
            raw.data = data.as_ptr() as *mut c_void;

            Async {
                lp: lp.clone(),
                raw: NonNull::from(Box::leak(raw)),
                data,
                state: AtomicU8::new(HandleState::Unarmed as u8),
                _marker: PhantomData,
            }
        })
    }

    /// Register `handler` and arm the handle. Calling it again replaces the
    /// handler; a payload sent to the old one and not yet dispatched is
    /// dropped and its future fails with [`Error::BrokenPromise`].
    pub fn start<F>(&self, mut handler: F) -> Result<(), Error>
    where
        F: FnMut(P) -> R + Send + 'static,
    {
        self.start_with_handle(move |_, payload| handler(payload))
    }

    /// Like [`start`](Self::start), with the handle passed to the handler.
    pub fn start_with_handle<F>(&self, handler: F) -> Result<(), Error>
    where
        F: FnMut(&Async<P, R>, P) -> R + Send + 'static,
    {
        let state = self.state();
        if is_any!(state, HandleState::Closing, HandleState::Closed) {
            return Err(Error::InvalidState(state));
        }

        let continuation: Arc<dyn Continuation> = Arc::new(AsyncContinuation::new(handler));
        let previous = self.data().continuation.lock().unwrap().replace(continuation);
        drop(previous);

        // SAFETY: `raw` is boxed and outlives its registration.
        check(unsafe {
            ffi::tether_async_init(Arc::as_ptr(&self.lp), self.raw.as_ptr(), async_trampoline)
        })?;
        // A close on the loop thread may have won the race since the check.
        if let Err(actual) = self.state.compare_exchange(
            state as u8,
            HandleState::Armed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(Error::InvalidState(HandleState::from_u8(actual)));
        }
        debug!(id = self.id(), restart = state == HandleState::Armed, "async handle started");
        Ok(())
    }

    /// Hand `payload` to the handler. Returns as soon as the wake is
    /// requested; the future completes once the loop has run the handler.
    pub fn send(&self, payload: P) -> Result<SharedFuture<R>, Error> {
        self.send_exclusive(payload).map(Future::share)
    }

    /// Like [`send`](Self::send), but the result is handed out by value
    /// through an exclusive [`Future`], so `R` need not be `Clone`.
    pub fn send_exclusive(&self, payload: P) -> Result<Future<R>, Error> {
        let state = self.state();
        if state != HandleState::Armed {
            return Err(Error::InvalidState(state));
        }

        let continuation = self
            .data()
            .continuation
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::InvalidState(state))?;
        let continuation = continuation
            .as_any()
            .downcast::<AsyncContinuation<P, R>>()
            .map_err(|_| Error::InvalidState(state))?;

        let future = continuation.init(payload);
        // SAFETY: `raw` lives as long as `self`.
        check(unsafe { ffi::tether_async_send(self.raw.as_ptr()) })?;
        Ok(future)
    }

    /// Detach from the loop. `on_close` runs on the loop thread during the
    /// next iteration; the returned future completes after it.
    ///
    /// Loop thread only. The handle keeps itself alive until `on_close` has
    /// run, so it is fine to drop every other reference right away.
    pub fn close<F>(self: &Arc<Self>, on_close: F) -> Result<SharedFuture<()>, Error>
    where
        F: FnOnce(&Async<P, R>) + Send + 'static,
    {
        if !self.lp.is_loop_thread() {
            return Err(Error::NotLoopThread);
        }

        match self.state() {
            HandleState::Unarmed => {
                self.set_state(HandleState::Closed);
                let closed = match catch(|| on_close(&**self)) {
                    Ok(()) => make_ready_future(()),
                    Err(e) => make_error_future(e),
                };
                Ok(closed.share())
            }
            HandleState::Armed => {
                let (continuation, future) = CloseContinuation::new(self.clone(), on_close);
                let continuation: Arc<dyn Continuation> = Arc::new(continuation);
                *self.data().close_continuation.lock().unwrap() = Some(continuation);
                self.set_state(HandleState::Closing);

                // SAFETY: the close continuation keeps `self` alive until the
                // callback has run.
                let status =
                    check(unsafe { ffi::tether_close(self.raw.as_ptr(), Some(close_trampoline)) });
                if let Err(e) = status {
                    self.data().close_continuation.lock().unwrap().take();
                    self.set_state(HandleState::Armed);
                    return Err(e);
                }
                debug!(id = self.id(), "async handle closing");
                Ok(future)
            }
            state => Err(Error::InvalidState(state)),
        }
    }

    /// Detach from the loop immediately. Loop thread only. A payload that
    /// was sent but not dispatched is dropped with [`Error::BrokenPromise`].
    pub fn stop(&self) -> Result<(), Error> {
        if !self.lp.is_loop_thread() {
            return Err(Error::NotLoopThread);
        }

        match self.state() {
            HandleState::Closed => return Ok(()),
            HandleState::Closing => return Err(Error::InvalidState(HandleState::Closing)),
            HandleState::Unarmed => {}
            HandleState::Armed => {
                // SAFETY: `raw` is valid; without a callback nothing refers
                // to it after the call.
                check(unsafe { ffi::tether_close(self.raw.as_ptr(), None) })?;
            }
        }
        self.set_state(HandleState::Closed);
        self.take_continuation();
        debug!(id = self.id(), "async handle stopped");
        Ok(())
    }
}

impl<P, R> Async<P, R> {
    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Registered with the loop and not closing.
    pub fn is_active(&self) -> bool {
        // SAFETY: `raw` lives as long as `self`.
        unsafe { ffi::tether_is_active(self.raw.as_ptr()) == 1 }
    }

    pub fn is_closing(&self) -> bool {
        // SAFETY: as above.
        unsafe { ffi::tether_is_closing(self.raw.as_ptr()) == 1 }
    }

    /// Loop-assigned id; `0` until first started.
    pub fn id(&self) -> u64 {
        self.raw().id()
    }

    pub fn loop_handle(&self) -> &Arc<Loop> {
        &self.lp
    }

    fn raw(&self) -> &RawAsync {
        // SAFETY: `raw` lives as long as `self`.
        unsafe { self.raw.as_ref() }
    }

    pub(crate) fn data(&self) -> &HandleData {
        // SAFETY: `data` lives as long as `self`.
        unsafe { self.data.as_ref() }
    }

    pub(crate) fn set_state(&self, state: HandleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Drop the registered continuation, failing any undispatched payload.
    pub(crate) fn take_continuation(&self) {
        let continuation = self.data().continuation.lock().unwrap().take();
        drop(continuation);
    }

    /// Free both allocations if the loop can no longer reach them.
    fn release(&mut self) -> bool {
        let releasable = match self.state() {
            HandleState::Unarmed | HandleState::Closed => true,
            // The loop refuses the close (EPERM) if it started running on
            // another thread since the check; the handle is leaked then.
            HandleState::Armed if self.lp.is_loop_thread() => {
                // SAFETY: `raw` is valid; no callback is registered for the close.
                let status = unsafe { ffi::tether_close(self.raw.as_ptr(), None) };
                status == tether_rt::status::OK
            }
            HandleState::Armed | HandleState::Closing => false,
        };
        if releasable {
            // SAFETY: both came from `Box::leak` in `new` and the loop holds
            // no reference to them any more.
            unsafe {
                drop(Box::from_raw(self.data.as_ptr()));
                drop(Box::from_raw(self.raw.as_ptr()));
            }
        }
        releasable
    }
}

impl<P, R> Drop for Async<P, R> {
    fn drop(&mut self) {
        let state = self.state();
        if self.release() {
            return;
        }
        error!(
            id = self.id(),
            %state,
            loop_thread = ?self.lp.loop_thread(),
            current = ?thread::current().id(),
            "async handle dropped while the loop may still use it; leaking it"
        );
        if !thread::panicking() {
            debug_assert!(false, "async handle dropped in state {state} off the loop thread");
        }
    }
}

impl<P, R> fmt::Debug for Async<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Async")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;
    use tether_rt::RunMode;

    fn new_loop() -> Arc<Loop> {
        Loop::new().unwrap()
    }

    #[test]
    fn send_runs_handler_on_next_iteration() {
        let lp = new_loop();
        let doubler = Async::<i32, i32>::new(&lp);
        doubler.start(|x| x * 2).unwrap();
        assert_eq!(doubler.state(), HandleState::Armed);
        assert!(doubler.is_active());

        let answer = doubler.send(21).unwrap();
        assert!(!answer.is_ready());
        lp.run(RunMode::NoWait).unwrap();
        assert_eq!(answer.get(), Ok(42));

        doubler.stop().unwrap();
    }

    #[test]
    fn send_before_start_is_invalid() {
        let lp = new_loop();
        let handle = Async::<u8, u8>::new(&lp);
        assert_eq!(handle.send(1).unwrap_err(), Error::InvalidState(HandleState::Unarmed));
    }

    #[derive(Debug, PartialEq)]
    struct Token(u32);

    #[test]
    fn results_need_not_be_clone() {
        let lp = new_loop();
        let handle = Async::<u32, Token>::new(&lp);
        handle.start(Token).unwrap();

        let owned = handle.send_exclusive(7).unwrap();
        lp.run(RunMode::NoWait).unwrap();
        assert_eq!(owned.get(), Ok(Token(7)));

        let shared = handle.send(8).unwrap();
        let next = shared.then_ref(|t| t.0 + 1);
        lp.run(RunMode::NoWait).unwrap();
        assert_eq!(shared.with(|t| t.0), Ok(8));
        assert_eq!(next.get(), Ok(9));
        handle.stop().unwrap();
    }

    /// Runs its closure when dropped.
    struct OnDrop<F: FnMut()>(F);

    impl<F: FnMut()> Drop for OnDrop<F> {
        fn drop(&mut self) {
            (self.0)()
        }
    }

    #[test]
    fn restart_losing_to_a_close_does_not_rearm() {
        let lp = new_loop();
        let handle = Async::<(), ()>::new(&lp);
        // Dropping the first handler marks the handle closing, as a close on
        // the loop thread would between the state check and re-arming.
        let weak = Arc::downgrade(&handle);
        let guard = OnDrop(move || {
            if let Some(h) = weak.upgrade() {
                h.set_state(HandleState::Closing);
            }
        });
        handle
            .start(move |()| {
                let _held = &guard;
            })
            .unwrap();

        assert_eq!(
            handle.start(|()| ()).unwrap_err(),
            Error::InvalidState(HandleState::Closing)
        );
        assert_eq!(handle.state(), HandleState::Closing);

        handle.set_state(HandleState::Armed);
        handle.stop().unwrap();
    }

    #[test]
    fn rapid_sends_keep_only_the_latest() {
        let lp = new_loop();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let handle = Async::<String, usize>::new(&lp);
        handle
            .start(move |s: String| {
                log.lock().unwrap().push(s.clone());
                s.len()
            })
            .unwrap();

        let first = handle.send("a".into()).unwrap();
        let second = handle.send("bb".into()).unwrap();
        let third = handle.send("ccc".into()).unwrap();
        lp.run(RunMode::NoWait).unwrap();

        assert_eq!(first.get(), Err(Error::Superseded));
        assert_eq!(second.get(), Err(Error::Superseded));
        assert_eq!(third.get(), Ok(3));
        assert_eq!(*seen.lock().unwrap(), vec!["ccc".to_string()]);
        handle.stop().unwrap();
    }

    #[test]
    fn handler_panic_is_captured_and_handle_keeps_working() {
        let lp = new_loop();
        let handle = Async::<i32, i32>::new(&lp);
        handle
            .start(|x| {
                if x < 0 {
                    panic!("negative input");
                }
                x
            })
            .unwrap();

        let bad = handle.send(-1).unwrap();
        lp.run(RunMode::NoWait).unwrap();
        assert_eq!(bad.get(), Err(Error::Panicked("negative input".into())));

        let good = handle.send(8).unwrap();
        lp.run(RunMode::NoWait).unwrap();
        assert_eq!(good.get(), Ok(8));
        handle.stop().unwrap();
    }

    #[test]
    fn unretrieved_error_is_silently_lost() {
        let lp = new_loop();
        let handle = Async::<(), ()>::new(&lp);
        handle.start(|()| panic!("nobody is listening")).unwrap();

        drop(handle.send(()).unwrap());
        assert!(lp.run(RunMode::NoWait).unwrap());
        handle.stop().unwrap();
        assert!(!lp.is_alive());
    }

    #[test]
    fn handler_can_send_to_itself() {
        let lp = new_loop();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = Async::<u32, u32>::new(&lp);
        handle
            .start_with_handle(move |h, n| {
                counter.fetch_add(1, Ordering::SeqCst);
                if n > 0 {
                    // Picked up on the next pass.
                    drop(h.send(n - 1).unwrap());
                }
                n
            })
            .unwrap();

        let first = handle.send(2).unwrap();
        lp.run(RunMode::NoWait).unwrap();
        assert_eq!(first.get(), Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        lp.run(RunMode::NoWait).unwrap();
        lp.run(RunMode::NoWait).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        handle.stop().unwrap();
    }

    #[test]
    fn restart_replaces_handler_and_breaks_pending_send() {
        let lp = new_loop();
        let handle = Async::<i32, i32>::new(&lp);
        handle.start(|x| x + 1).unwrap();
        let id = handle.id();

        let orphan = handle.send(1).unwrap();
        handle.start(|x| x - 1).unwrap();
        assert_eq!(orphan.get(), Err(Error::BrokenPromise));
        assert_eq!(handle.id(), id);
        assert_eq!(lp.active_handles(), 1);

        let next = handle.send(1).unwrap();
        lp.run(RunMode::NoWait).unwrap();
        assert_eq!(next.get(), Ok(0));
        handle.stop().unwrap();
    }

    #[test]
    fn close_runs_callback_next_iteration() {
        let lp = new_loop();
        let handle = Async::<(), ()>::new(&lp);
        handle.start(|()| ()).unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let done = handle
            .close(move |h| {
                assert_eq!(h.state(), HandleState::Closed);
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(handle.state(), HandleState::Closing);
        assert!(handle.is_closing());
        assert_eq!(handle.send(()).unwrap_err(), Error::InvalidState(HandleState::Closing));
        assert_eq!(handle.stop().unwrap_err(), Error::InvalidState(HandleState::Closing));

        assert!(!lp.run(RunMode::Default).unwrap());
        assert_eq!(done.get(), Ok(()));
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(handle.state(), HandleState::Closed);
        assert_eq!(handle.send(()).unwrap_err(), Error::InvalidState(HandleState::Closed));
    }

    #[test]
    fn close_keeps_handle_alive_until_callback() {
        let lp = new_loop();
        let handle = Async::<(), ()>::new(&lp);
        handle.start(|()| ()).unwrap();
        let done = handle.close(|_| ()).unwrap();
        drop(handle);

        lp.run(RunMode::Default).unwrap();
        assert_eq!(done.get(), Ok(()));
        assert_eq!(lp.active_handles(), 0);
    }

    #[test]
    fn close_breaks_undispatched_send() {
        let lp = new_loop();
        let handle = Async::<u8, u8>::new(&lp);
        handle.start(|x| x).unwrap();
        let pending = handle.send(1).unwrap();
        let done = handle.close(|_| ()).unwrap();

        lp.run(RunMode::Default).unwrap();
        assert_eq!(done.get(), Ok(()));
        assert_eq!(pending.get(), Err(Error::BrokenPromise));
    }

    #[test]
    fn close_unarmed_is_immediate() {
        let lp = new_loop();
        let handle = Async::<(), ()>::new(&lp);
        let done = handle.close(|_| ()).unwrap();
        assert!(done.is_ready());
        assert_eq!(handle.state(), HandleState::Closed);
        assert_eq!(handle.start(|()| ()).unwrap_err(), Error::InvalidState(HandleState::Closed));
    }

    #[test]
    fn stop_is_idempotent_and_breaks_pending_send() {
        let lp = new_loop();
        let handle = Async::<u8, u8>::new(&lp);
        handle.start(|x| x).unwrap();
        let pending = handle.send(4).unwrap();

        handle.stop().unwrap();
        assert_eq!(pending.get(), Err(Error::BrokenPromise));
        assert!(!handle.is_active());
        handle.stop().unwrap();
        assert_eq!(lp.active_handles(), 0);

        // The queued wake is stale and must not reach the handler.
        lp.run(RunMode::NoWait).unwrap();
    }

    #[test]
    fn handler_may_stop_its_own_handle() {
        let lp = new_loop();
        let handle = Async::<(), u64>::new(&lp);
        handle
            .start_with_handle(|h, ()| {
                h.stop().unwrap();
                h.id()
            })
            .unwrap();

        let id = handle.send(()).unwrap();
        assert!(!lp.run(RunMode::Default).unwrap());
        assert_eq!(id.get(), Ok(handle.id()));
        assert_eq!(handle.state(), HandleState::Closed);
    }

    #[test]
    fn drop_on_loop_thread_stops_armed_handle() {
        let lp = new_loop();
        let handle = Async::<(), ()>::new(&lp);
        handle.start(|()| ()).unwrap();
        assert_eq!(lp.active_handles(), 1);
        drop(handle);
        assert_eq!(lp.active_handles(), 0);
        assert!(!lp.is_alive());
    }

    #[test]
    fn handle_dropped_inside_its_handler() {
        let lp = new_loop();
        let handle = Async::<(), ()>::new(&lp);
        let slot = Arc::new(Mutex::new(Some(handle.clone())));
        let held = slot.clone();
        handle
            .start(move |()| {
                held.lock().unwrap().take();
            })
            .unwrap();

        let done = handle.send(()).unwrap();
        drop(handle);
        lp.run(RunMode::NoWait).unwrap();
        assert_eq!(done.get(), Ok(()));
        assert!(slot.lock().unwrap().is_none());
        assert_eq!(lp.active_handles(), 0);
    }

    #[test]
    fn close_off_loop_thread_is_refused() {
        let lp = new_loop();
        let handle = Async::<(), ()>::new(&lp);
        handle.start(|()| ()).unwrap();

        let runner = {
            let lp = lp.clone();
            thread::spawn(move || lp.run(RunMode::Default))
        };
        // Answered, so the loop is now running on the other thread.
        handle.send(()).unwrap().wait();

        assert_eq!(handle.close(|_| ()).unwrap_err(), Error::NotLoopThread);
        assert_eq!(handle.stop().unwrap_err(), Error::NotLoopThread);

        lp.stop();
        runner.join().unwrap().unwrap();
        handle.stop().unwrap();
    }

    #[cfg(debug_assertions)]
    #[test]
    fn drop_off_loop_thread_while_running_asserts() {
        let lp = new_loop();
        let handle = Async::<(), ()>::new(&lp);
        handle.start(|()| ()).unwrap();

        let runner = {
            let lp = lp.clone();
            thread::spawn(move || lp.run(RunMode::Default))
        };
        // Answered, so the loop is now running on the other thread.
        handle.send(()).unwrap().wait();

        let dropper = thread::spawn(move || drop(handle));
        assert!(dropper.join().is_err());

        lp.stop();
        runner.join().unwrap().unwrap();
    }
}
