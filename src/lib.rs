//! tether: hand work to a single-threaded loop from any thread and get the
//! results back as futures.
//!
//! - [`Async`] is a wake handle. `start` registers a handler that runs on the
//!   loop thread; `send` hands it a payload from anywhere and returns a
//!   [`SharedFuture`] of the result.
//! - [`Future`] / [`SharedFuture`] / [`Promise`] are blocking single-assignment
//!   slots that can also be awaited.
//! - [`then`] and [`then_flatten`] chain work onto futures, unwrapping nested
//!   pending results.
//! - [`LazyValue`] is a thread-safe lazily initialized value.
//!
//! The loop itself lives in `tether-rt` and is reached through its C ABI.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::thread;
//! use tether::{default_loop, Async, RunMode};
//!
//! let lp = default_loop()?;
//! let handle = Async::<String, usize>::new(&lp);
//! handle.start(|line| line.len())?;
//!
//! let producer = {
//!     let handle = handle.clone();
//!     thread::spawn(move || handle.send("hello".into())?.get())
//! };
//! lp.run(RunMode::Once)?;
//! assert_eq!(producer.join().unwrap()?, 5);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod async_handle;
mod continuation;
mod error;
mod future;
mod handle;
mod lazy;
mod then;

pub use async_handle::Async;
pub use error::{Error, HandleState};
pub use future::{
    make_error_future, make_ready_future, promise, Future, FutureStatus, Promise, SharedFuture,
};
pub use lazy::LazyValue;
pub use then::{launch, then, then_flatten, Launch, Source, Step};

pub use tether_rt::utils::{clamp, clamp_by, TrivialPair};
pub use tether_rt::{is_any, Loop, LoopBuilder, LoopConfig, RunMode};

use std::sync::Arc;

use async_ffi::FutureExt;

use crate::error::check;

static DEFAULT_LOOP: LazyValue<Arc<Loop>> = LazyValue::new(create_default_loop);

fn create_default_loop() -> Result<Arc<Loop>, Error> {
    let lp = Loop::with_config(LoopConfig::from_env())?;
    tracing::debug!(name = %lp.config().name, "default loop created");
    Ok(lp)
}

/// The process-wide loop, created on first use from
/// [`LoopConfig::from_env`]. If creating it fails, the next call retries.
pub fn default_loop() -> Result<Arc<Loop>, Error> {
    DEFAULT_LOOP.get().cloned()
}

/// Spawn a future onto `lp`'s executor. It runs on the loop thread.
pub fn spawn<F>(lp: &Arc<Loop>, future: F) -> Result<(), Error>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    // SAFETY: `lp` is a live loop.
    check(unsafe { tether_rt::ffi::tether_loop_spawn(Arc::as_ptr(lp), future.into_ffi()) })
}
