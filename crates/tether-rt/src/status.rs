//! Status codes returned across the C ABI.
//!
//! `0` is success; failures are negated `errno` values, the same convention
//! the wake handle functions in [`crate::ffi`] use.

use std::io;
use std::os::raw::c_int;

pub const OK: c_int = 0;
pub const EINVAL: c_int = -libc::EINVAL;
pub const EBUSY: c_int = -libc::EBUSY;
pub const EPERM: c_int = -libc::EPERM;
pub const EBADF: c_int = -libc::EBADF;
pub const ENOSYS: c_int = -libc::ENOSYS;
pub const EIO: c_int = -libc::EIO;

/// Symbolic name of a status code (`"EBUSY"`, ...). Unknown codes map to
/// `"UNKNOWN"`.
pub fn err_name(code: c_int) -> &'static str {
    match -code {
        0 => "OK",
        libc::EINVAL => "EINVAL",
        libc::EBUSY => "EBUSY",
        libc::EPERM => "EPERM",
        libc::EBADF => "EBADF",
        libc::ENOSYS => "ENOSYS",
        libc::EIO => "EIO",
        libc::EINTR => "EINTR",
        libc::ENOMEM => "ENOMEM",
        libc::EAGAIN => "EAGAIN",
        libc::EMFILE => "EMFILE",
        _ => "UNKNOWN",
    }
}

/// Human readable description of a status code.
pub fn strerror(code: c_int) -> String {
    if code == OK {
        return "success".to_string();
    }
    io::Error::from_raw_os_error(-code).to_string()
}

/// Translate an OS error into a status code.
pub fn from_io(err: &io::Error) -> c_int {
    match err.raw_os_error() {
        Some(errno) if errno > 0 => -errno,
        _ => EIO,
    }
}
