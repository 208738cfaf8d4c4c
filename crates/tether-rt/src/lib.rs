//! tether-rt: the single-threaded wake loop.
//!
//! A [`Loop`] owns an OS poller used purely as a cross-thread wake-up
//! primitive, a registry of raw wake handles ([`RawAsync`]), and a small
//! executor for futures that must run on the loop thread.
//!
//! Wake handles are driven through the C ABI in [`ffi`]: callbacks are
//! `extern "C"` function pointers and per-handle state travels through the
//! opaque `RawAsync::data` pointer. Safe wrappers live in the `tether` crate.

pub mod config;
mod executor;
pub mod ffi;
mod handle;
mod reactor;
pub mod status;
pub mod utils;

pub use config::{LoopBuilder, LoopConfig};
pub use handle::{AsyncCb, CloseCb, RawAsync};
pub use reactor::{Loop, RunMode};
