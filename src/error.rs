use std::{fmt::Display, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors thay may occur in this library.
///
/// Every variant maps to a stable negative integer through [`Error::code`],
/// for callers which need C-style return codes.
#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// The caller passed something unusable.
    /// Detected before any I/O takes place.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Unknown or stale handle, or a value which is not there.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Nothing matching arrived in time.
    #[error("Timed out")]
    Timeout,

    /// An allocation could not be made.
    #[error("Out of memory")]
    NoMemory,

    /// The resource is in use, or full.
    #[error("Busy: {0}")]
    Busy(String),

    /// The context was never initialised, or has been deinitialised.
    #[error("Not initialised")]
    NotInitialised,

    /// A UBX frame did not match its checksum.
    #[error("UBX checksum mismatch")]
    Checksum,

    /// A UBX frame is not complete yet.
    #[error("Incomplete frame, {needed} more byte(s) needed")]
    Incomplete {
        /// How many bytes are missing, at least.
        needed: usize,
    },

    /// The buffer did not start with the UBX sync characters.
    #[error("UBX sync characters not found")]
    NoSync,

    /// The feature is not available.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The module answered with an error stop tag.
    #[error("Device reported an error: {0}")]
    Device(DeviceError),

    /// The module answered with something which could not be parsed.
    #[error("Malformed response: {0}")]
    BadResponse(String),

    /// A response line did not fit and was cut.
    #[error("Response line truncated at {0} bytes")]
    Truncated(usize),

    /// Reading or writing the underlying stream failed.
    #[error("Transport problem: {0}")]
    Transport(String),

    /// The AT client or its receive task has gone away.
    #[error("Closed")]
    Closed,

    /// An AT exchange was attempted from inside a URC handler.
    #[error("AT exchanges cannot be started from within a URC handler, use a callback")]
    Reentrant,
}

impl Error {
    /// The C-style negative error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotSupported(_) => -2,
            Error::InvalidParameter(_) => -5,
            Error::NoMemory => -6,
            Error::NotFound(_) => -8,
            Error::Timeout => -9,
            Error::Closed => -11,
            Error::NotInitialised => -12,
            Error::Busy(_) => -14,
            Error::Device(_) => -15,
            Error::Transport(_) => -16,
            Error::Reentrant => -17,
            Error::BadResponse(_) => -18,
            Error::Truncated(_) => -19,
            Error::Checksum => -20,
            Error::Incomplete { .. } => -21,
            Error::NoSync => -22,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Which stop tag a device error came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    /// A plain `ERROR`.
    Plain,

    /// `+CME ERROR:`, equipment errors.
    Cme,

    /// `+CMS ERROR:`, message service errors.
    Cms,

    /// `ABORTED`, the command was interrupted.
    Aborted,
}

/// The error a module reported at the end of an exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceError {
    /// Which stop tag.
    pub kind: DeviceErrorKind,

    /// The numeric code, if the module reported one
    /// (verbose error reporting gives text instead).
    pub code: Option<i32>,

    /// The text after the stop tag, if any.
    pub text: String,
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.kind, self.code) {
            (DeviceErrorKind::Plain, _) => write!(f, "ERROR"),
            (DeviceErrorKind::Aborted, _) => write!(f, "ABORTED"),
            (DeviceErrorKind::Cme, Some(code)) => write!(f, "+CME ERROR: {code}"),
            (DeviceErrorKind::Cms, Some(code)) => write!(f, "+CMS ERROR: {code}"),
            (DeviceErrorKind::Cme, None) => write!(f, "+CME ERROR: {}", self.text),
            (DeviceErrorKind::Cms, None) => write!(f, "+CMS ERROR: {}", self.text),
        }
    }
}
