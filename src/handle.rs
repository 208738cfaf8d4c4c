//! The user-data block behind every wake handle and the fixed callbacks the
//! loop invokes with it.

use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tether_rt::RawAsync;
use tracing::error;

use crate::continuation::Continuation;

type Slot = Mutex<Option<Arc<dyn Continuation>>>;

/// What `RawAsync::data` points at. Allocated once per handle; its address
/// never changes.
pub(crate) struct HandleData {
    pub(crate) continuation: Slot,
    pub(crate) close_continuation: Slot,
    pub(crate) this: OwnerRef,
}

impl HandleData {
    pub(crate) fn new(this: OwnerRef) -> Self {
        HandleData {
            continuation: Mutex::new(None),
            close_continuation: Mutex::new(None),
            this,
        }
    }
}

/// Untyped weak back-pointer to the object owning a [`HandleData`].
///
/// Holding the weak count keeps the owner's allocation in place, so the
/// pointer stays valid to upgrade even after the owner itself is dropped.
pub(crate) struct OwnerRef {
    ptr: *const (),
    release: unsafe fn(*const ()),
}

// SAFETY: only ever used to upgrade or release a `Weak<T>` of a Send + Sync T.
unsafe impl Send for OwnerRef {}
unsafe impl Sync for OwnerRef {}

impl OwnerRef {
    pub(crate) fn new<T: Send + Sync>(weak: Weak<T>) -> Self {
        OwnerRef {
            ptr: Weak::into_raw(weak) as *const (),
            release: release::<T>,
        }
    }

    pub(crate) fn as_ptr(&self) -> *const () {
        self.ptr
    }

    /// # Safety
    /// `ptr` must come from [`OwnerRef::as_ptr`] of a live `OwnerRef` built
    /// from a `Weak<T>`.
    pub(crate) unsafe fn upgrade<T>(ptr: *const ()) -> Option<Arc<T>> {
        if ptr.is_null() {
            return None;
        }
        let weak = ManuallyDrop::new(Weak::from_raw(ptr as *const T));
        weak.upgrade()
    }
}

unsafe fn release<T>(ptr: *const ()) {
    drop(Weak::from_raw(ptr as *const T));
}

impl Drop for OwnerRef {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `Weak::<T>::into_raw` with the matching `T`.
        unsafe { (self.release)(self.ptr) }
    }
}

/// Wake callback for every `Async`.
pub(crate) extern "C" fn async_trampoline(handle: *mut RawAsync) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the loop only calls this for registered handles, whose
        // `data` points at a live block.
        let data = unsafe { &*((*handle).data as *const HandleData) };
        let continuation = data.continuation.lock().unwrap().clone();
        let owner = data.this.as_ptr();
        // The dispatch may free `data`; only the clone is used from here.
        if let Some(continuation) = continuation {
            continuation.dispatch(owner);
        }
    }));
    if outcome.is_err() {
        error!("panic escaped wake dispatch");
    }
}

/// Close callback for every `Async`.
pub(crate) extern "C" fn close_trampoline(handle: *mut RawAsync) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the close continuation keeps the handle, and so `data`,
        // alive until it has run.
        let data = unsafe { &*((*handle).data as *const HandleData) };
        let continuation = data.close_continuation.lock().unwrap().take();
        let owner = data.this.as_ptr();
        if let Some(continuation) = continuation {
            continuation.dispatch(owner);
        }
    }));
    if outcome.is_err() {
        error!("panic escaped close dispatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_ref_upgrades_while_owner_lives() {
        let owner = Arc::new(String::from("owner"));
        let this = OwnerRef::new(Arc::downgrade(&owner));
        let again = unsafe { OwnerRef::upgrade::<String>(this.as_ptr()) }.unwrap();
        assert!(Arc::ptr_eq(&owner, &again));
        drop(again);

        drop(owner);
        assert!(unsafe { OwnerRef::upgrade::<String>(this.as_ptr()) }.is_none());
    }

    #[test]
    fn owner_ref_releases_weak_count() {
        let owner = Arc::new(5u8);
        let this = OwnerRef::new(Arc::downgrade(&owner));
        assert_eq!(Arc::weak_count(&owner), 1);
        drop(this);
        assert_eq!(Arc::weak_count(&owner), 0);
    }

    #[test]
    fn null_owner_does_not_upgrade() {
        assert!(unsafe { OwnerRef::upgrade::<u8>(std::ptr::null()) }.is_none());
    }
}
