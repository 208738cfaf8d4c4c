//! Raw wake handle shared with the C ABI.

use std::os::raw::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::reactor::Loop;

/// Callback fired on the loop thread after a wake request.
pub type AsyncCb = extern "C" fn(handle: *mut RawAsync);

/// Callback fired on the loop thread once a close has completed.
pub type CloseCb = extern "C" fn(handle: *mut RawAsync);

pub(crate) const FLAG_ACTIVE: u8 = 0b001;
pub(crate) const FLAG_CLOSING: u8 = 0b010;
pub(crate) const FLAG_CLOSED: u8 = 0b100;

/// A wake primitive owned by the caller and registered with a [`Loop`].
///
/// The caller must keep the handle at a stable address from
/// [`tether_async_init`](crate::ffi::tether_async_init) until it has been
/// closed (for a close with a callback: until that callback has run).
#[repr(C)]
pub struct RawAsync {
    /// Opaque user data. Never touched by the loop.
    pub data: *mut c_void,
    pub(crate) lp: *const Loop,
    pub(crate) key: usize,
    pub(crate) id: u64,
    /// Set by a sender, cleared by the loop right before the callback runs.
    pub(crate) pending: AtomicBool,
    pub(crate) flags: AtomicU8,
}

impl RawAsync {
    /// A detached handle: not registered with any loop.
    pub fn new() -> Self {
        Self {
            data: ptr::null_mut(),
            lp: ptr::null(),
            key: usize::MAX,
            id: 0,
            pending: AtomicBool::new(false),
            flags: AtomicU8::new(0),
        }
    }

    /// Registered and not closing.
    pub fn is_active(&self) -> bool {
        self.flags.load(Ordering::Acquire) == FLAG_ACTIVE
    }

    /// Closing or closed.
    pub fn is_closing(&self) -> bool {
        self.flags.load(Ordering::Acquire) & (FLAG_CLOSING | FLAG_CLOSED) != 0
    }

    pub fn is_closed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_CLOSED != 0
    }

    /// Unique id assigned at registration; `0` while detached.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for RawAsync {
    fn default() -> Self {
        Self::new()
    }
}

/// Pointer wrapper so registry entries can live in a `Mutex`.
#[derive(Clone, Copy)]
pub(crate) struct HandlePtr(pub(crate) *mut RawAsync);

// The loop only dereferences these on its own thread, and the owner keeps the
// handle alive until it is closed.
unsafe impl Send for HandlePtr {}
