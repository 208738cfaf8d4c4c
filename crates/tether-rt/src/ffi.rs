//! C ABI entry points for raw wake handles.
//!
//! All functions are `extern "C"`, take raw pointers, and report failures as
//! negative status codes (see [`crate::status`]). Callbacks passed in run on
//! the loop thread; they must not unwind.

// `Loop` is opaque to C callers; only pointers to it cross the boundary.
#![allow(improper_ctypes_definitions)]

use std::os::raw::c_int;

use async_ffi::FfiFuture;

use crate::handle::{AsyncCb, CloseCb, RawAsync};
use crate::reactor::Loop;
use crate::status;

// ── Wake handles ────────────────────────────────────────────────────

/// Register `handle` with `lp` and arm it with `cb`. Calling it again on an
/// armed handle replaces the callback.
///
/// # Safety
/// `lp` and `handle` must be valid; `handle` must not move until closed.
#[no_mangle]
pub unsafe extern "C" fn tether_async_init(
    lp: *const Loop,
    handle: *mut RawAsync,
    cb: AsyncCb,
) -> c_int {
    if lp.is_null() || handle.is_null() {
        return status::EINVAL;
    }
    (*lp).async_init(handle, cb)
}

/// Request that the loop runs the handle's callback soon. Callable from any
/// thread. Requests made while one is pending collapse into it.
///
/// # Safety
/// `handle` must be valid.
#[no_mangle]
pub unsafe extern "C" fn tether_async_send(handle: *mut RawAsync) -> c_int {
    if handle.is_null() {
        return status::EINVAL;
    }
    let lp = (*handle).lp;
    if lp.is_null() {
        return status::EINVAL;
    }
    (*lp).async_send(&*handle)
}

/// Close `handle`. Loop thread only (`EPERM` otherwise). With `cb` the close
/// completes on the next loop iteration, without it immediately.
///
/// # Safety
/// `handle` must be valid, and stay valid until `cb` has run.
#[no_mangle]
pub unsafe extern "C" fn tether_close(handle: *mut RawAsync, cb: Option<CloseCb>) -> c_int {
    if handle.is_null() {
        return status::EINVAL;
    }
    let lp = (*handle).lp;
    if lp.is_null() {
        return status::EINVAL;
    }
    (*lp).close(handle, cb)
}

/// 1 if registered and not closing, 0 otherwise.
///
/// # Safety
/// `handle` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn tether_is_active(handle: *const RawAsync) -> c_int {
    match handle.as_ref() {
        Some(h) => h.is_active() as c_int,
        None => 0,
    }
}

/// 1 if closing or closed, 0 otherwise.
///
/// # Safety
/// `handle` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn tether_is_closing(handle: *const RawAsync) -> c_int {
    match handle.as_ref() {
        Some(h) => h.is_closing() as c_int,
        None => 0,
    }
}

// ── Executor ────────────────────────────────────────────────────────

/// Spawn a future onto the loop's executor.
///
/// # Safety
/// `lp` must be valid.
#[no_mangle]
pub unsafe extern "C" fn tether_loop_spawn(lp: *const Loop, future: FfiFuture<()>) -> c_int {
    if lp.is_null() {
        return status::EINVAL;
    }
    (*lp).spawn(future);
    status::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::RunMode;
    use async_ffi::FutureExt;
    use std::ptr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    extern "C" fn noop(_: *mut RawAsync) {}

    #[test]
    fn null_pointers_are_rejected() {
        let lp = Loop::new().unwrap();
        unsafe {
            assert_eq!(tether_async_init(ptr::null(), ptr::null_mut(), noop), status::EINVAL);
            assert_eq!(
                tether_async_init(Arc::as_ptr(&lp), ptr::null_mut(), noop),
                status::EINVAL
            );
            assert_eq!(tether_async_send(ptr::null_mut()), status::EINVAL);
            assert_eq!(tether_close(ptr::null_mut(), None), status::EINVAL);
            assert_eq!(tether_is_active(ptr::null()), 0);
            assert_eq!(tether_is_closing(ptr::null()), 0);
        }
    }

    #[test]
    fn detached_handle_cannot_send_or_close() {
        let mut raw = RawAsync::new();
        unsafe {
            assert_eq!(tether_async_send(&mut raw), status::EINVAL);
            assert_eq!(tether_close(&mut raw, None), status::EINVAL);
            assert_eq!(tether_is_active(&raw), 0);
        }
    }

    #[test]
    fn init_send_close_through_abi() {
        let lp = Loop::new().unwrap();
        let mut raw = Box::new(RawAsync::new());
        let handle: *mut RawAsync = &mut *raw;
        unsafe {
            assert_eq!(tether_async_init(Arc::as_ptr(&lp), handle, noop), status::OK);
            assert_eq!(tether_is_active(handle), 1);
            assert_eq!(tether_async_send(handle), status::OK);
            lp.run(RunMode::NoWait).unwrap();
            assert_eq!(tether_close(handle, None), status::OK);
            assert_eq!(tether_is_closing(handle), 1);
            assert_eq!(tether_is_active(handle), 0);
        }
        assert!(!lp.is_alive());
    }

    #[test]
    fn spawn_ffi_future() {
        let lp = Loop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let future = async move {
            flag.store(true, Ordering::SeqCst);
        }
        .into_ffi();

        assert_eq!(unsafe { tether_loop_spawn(Arc::as_ptr(&lp), future) }, status::OK);
        lp.run(RunMode::Default).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
