//! Engine error kinds and the errno contract

use std::cell::RefCell;
use thiserror::Error;

/// Failures surfaced by the engine's entry points
///
/// Invariant violations that indicate on-media corruption (an unknown entry
/// type during replay, a lane released more often than held, a duplicate
/// user buffer while verification is on) are not representable here; the
/// engine treats those as fatal and panics.
#[derive(Debug, Error)]
pub enum Error {
    /// Heap exhausted, oversize request, or log reservation failed
    #[error("out of memory")]
    OutOfMemory,

    /// Malformed argument, unknown flag, wrong pool, or buffer overlap
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// Arithmetic overflow in a size estimator or a bound violation
    #[error("value out of range")]
    Range,

    /// Transaction aborted with no more specific reason
    #[error("transaction canceled")]
    Canceled,

    /// A timed lock acquisition expired
    #[error("operation timed out")]
    TimedOut,

    /// Resource is held by someone else
    #[error("resource busy")]
    Busy,

    /// Key or identifier already present
    #[error("already exists")]
    Exists,

    /// The pool file failed a structural check
    #[error("pool corrupt: {0}")]
    Corrupt(&'static str),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The closest `errno` value for this failure
    pub fn errno(&self) -> i32 {
        match self {
            Error::OutOfMemory => libc::ENOMEM,
            Error::Invalid(_) => libc::EINVAL,
            Error::Range => libc::ERANGE,
            Error::Canceled => libc::ECANCELED,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Busy => libc::EBUSY,
            Error::Exists => libc::EEXIST,
            Error::Corrupt(_) => libc::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub(crate) fn from_errno(errnum: i32) -> Error {
        match errnum {
            libc::ENOMEM => Error::OutOfMemory,
            libc::ERANGE => Error::Range,
            libc::ECANCELED => Error::Canceled,
            libc::ETIMEDOUT => Error::TimedOut,
            libc::EBUSY => Error::Busy,
            libc::EEXIST => Error::Exists,
            _ => Error::Invalid("transaction failed"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

thread_local! {
    static ERRORMSG: RefCell<String> = RefCell::new(String::new());
}

/// Records the message returned by [`errormsg`] for the calling thread
pub(crate) fn set_errormsg(e: &Error) {
    ERRORMSG.with(|m| *m.borrow_mut() = e.to_string());
}

/// The last failure message recorded on this thread
pub fn errormsg() -> String {
    ERRORMSG.with(|m| m.borrow().clone())
}

/// Records the message and hands the error back, for use in `return` paths
pub(crate) fn fail<T>(e: Error) -> Result<T> {
    set_errormsg(&e);
    Err(e)
}
