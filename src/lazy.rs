//! A value initialized on first use, shareable across threads.
//!
//! # Safety
//!
//! - `value` is written once, by the thread that moved `attempt` to
//!   `Running`, and only read after `ready` is observed `true` (Acquire).
//! - `ready` is set with Release after the write, under the `attempt` lock.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use tracing::debug;

use crate::error::Error;
use crate::future::catch;

enum Attempt {
    Idle,
    Running { generation: u64 },
    /// The last attempt failed; the next `get` retries.
    Failed { generation: u64, error: Error },
}

/// A lazily initialized value, usable as a `static`.
///
/// `init` runs at most once at a time. Concurrent callers block until it
/// finishes rather than running it again. If it fails (returns an error or
/// panics), the error is returned to that caller and to everyone who was
/// waiting on the attempt; a later `get` tries again.
///
/// ```
/// use tether::{Error, LazyValue};
///
/// static ANSWER: LazyValue<u32> = LazyValue::new(|| Ok::<_, Error>(42));
/// assert_eq!(*ANSWER.get().unwrap(), 42);
/// ```
pub struct LazyValue<T, F = fn() -> Result<T, Error>> {
    value: UnsafeCell<MaybeUninit<T>>,
    ready: AtomicBool,
    attempt: Mutex<(Attempt, u64)>,
    done: Condvar,
    init: F,
}

// SAFETY: `&LazyValue` hands out `&T` (needs Sync) and may run `init` on any
// thread, storing a `T` another thread drops (needs Send).
unsafe impl<T: Send + Sync, F: Sync> Sync for LazyValue<T, F> {}
unsafe impl<T: Send, F: Send> Send for LazyValue<T, F> {}

impl<T, F> LazyValue<T, F>
where
    F: Fn() -> Result<T, Error>,
{
    pub const fn new(init: F) -> Self {
        LazyValue {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            ready: AtomicBool::new(false),
            attempt: Mutex::new((Attempt::Idle, 0)),
            done: Condvar::new(),
            init,
        }
    }

    /// The value, initializing it if needed.
    pub fn get(&self) -> Result<&T, Error> {
        if let Some(value) = self.try_get() {
            return Ok(value);
        }

        let generation = {
            let mut guard = self.attempt.lock().unwrap();
            loop {
                if self.ready.load(Ordering::Acquire) {
                    // SAFETY: see module docs.
                    return Ok(unsafe { (*self.value.get()).assume_init_ref() });
                }
                let running = match guard.0 {
                    Attempt::Running { generation } => Some(generation),
                    Attempt::Idle | Attempt::Failed { .. } => None,
                };
                let Some(waiting_on) = running else {
                    guard.1 += 1;
                    let generation = guard.1;
                    guard.0 = Attempt::Running { generation };
                    break generation;
                };

                guard = self.done.wait(guard).unwrap();
                if let Attempt::Failed { generation, ref error } = guard.0 {
                    if generation == waiting_on {
                        return Err(error.clone());
                    }
                }
            }
        };

        // `init` runs unlocked so it may block on other work.
        let result = catch(|| (self.init)()).and_then(|r| r);

        let mut guard = self.attempt.lock().unwrap();
        let outcome = match result {
            Ok(value) => {
                // SAFETY: only this thread holds `Running`; nothing reads
                // `value` before `ready` is set.
                unsafe { (*self.value.get()).write(value) };
                self.ready.store(true, Ordering::Release);
                guard.0 = Attempt::Idle;
                // SAFETY: just written.
                Ok(unsafe { (*self.value.get()).assume_init_ref() })
            }
            Err(error) => {
                debug!(generation, error = %error, "lazy initialization failed");
                guard.0 = Attempt::Failed {
                    generation,
                    error: error.clone(),
                };
                Err(error)
            }
        };
        drop(guard);
        self.done.notify_all();
        outcome
    }
}

impl<T, F> LazyValue<T, F> {
    /// The value if it is already initialized. Never blocks.
    pub fn try_get(&self) -> Option<&T> {
        if self.ready.load(Ordering::Acquire) {
            // SAFETY: see module docs.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl<T, F> Drop for LazyValue<T, F> {
    fn drop(&mut self) {
        if *self.ready.get_mut() {
            // SAFETY: initialized, and `&mut self` means no readers remain.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

impl<T: fmt::Debug, F> fmt::Debug for LazyValue<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_get() {
            Some(value) => f.debug_tuple("LazyValue").field(value).finish(),
            None => f.write_str("LazyValue(<uninit>)"),
        }
    }
}
