use std::any::Any;
use std::fmt;
use std::io;
use std::os::raw::c_int;

use tether_rt::status;

/// Lifecycle of a wake handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleState {
    /// Constructed, no handler registered.
    Unarmed = 0,
    /// Handler registered with the loop; `send` is allowed.
    Armed = 1,
    /// Close requested; the close callback has not run yet.
    Closing = 2,
    /// Detached from the loop. Terminal.
    Closed = 3,
}

impl HandleState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => HandleState::Unarmed,
            1 => HandleState::Armed,
            2 => HandleState::Closing,
            _ => HandleState::Closed,
        }
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Unarmed => "unarmed",
            HandleState::Armed => "armed",
            HandleState::Closing => "closing",
            HandleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything that can end up in a future's error channel or be returned
/// synchronously by a handle operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A non-zero status from the loop.
    #[error("{name}: {message}")]
    Status {
        code: i32,
        name: &'static str,
        message: String,
    },

    /// A handler or continuation panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The promise was dropped without a value.
    #[error("broken promise")]
    BrokenPromise,

    /// A later `send` replaced this payload before the loop consumed it.
    #[error("payload superseded by a later send")]
    Superseded,

    /// The value of an exclusive future was already taken.
    #[error("future already retrieved")]
    AlreadyRetrieved,

    /// The operation is not supported in the handle's current state.
    #[error("operation not supported on a {0} handle")]
    InvalidState(HandleState),

    /// The operation must run on the loop thread.
    #[error("operation must run on the loop thread")]
    NotLoopThread,
}

impl Error {
    /// Translate a loop status code.
    pub fn from_status(code: c_int) -> Self {
        Error::Status {
            code,
            name: status::err_name(code),
            message: status::strerror(code),
        }
    }

    /// Build `Panicked` from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panicked(message)
    }

    /// The status code, for `Status` errors.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_status(status::from_io(&err))
    }
}

/// `Ok(())` for status `0`, the translated error otherwise.
pub(crate) fn check(code: c_int) -> Result<(), Error> {
    if code == status::OK {
        Ok(())
    } else {
        Err(Error::from_status(code))
    }
}
