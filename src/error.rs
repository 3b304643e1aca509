use std::borrow::Cow;
use std::fmt;
use std::io;

/// Code reported when an underlying failure carried no OS error number.
pub(crate) const NO_OS_CODE: i32 = -1;

/// An OS-level failure normalized to a numeric code plus a description.
///
/// Failures reach this crate from heterogeneous sources (the resolver,
/// `socket(2)`, `bind(2)`, `connect(2)`, thread spawning). They are all
/// flattened to the error number the OS reported and a human readable
/// message, so callers porting from C-style APIs can keep comparing codes.
#[derive(Debug, Clone)]
pub struct OsError {
    code: i32,
    message: Cow<'static, str>,
}

impl OsError {
    pub(crate) fn from_io(err: &io::Error) -> OsError {
        OsError {
            code: err.raw_os_error().unwrap_or(NO_OS_CODE),
            message: Cow::Owned(err.to_string()),
        }
    }

    pub(crate) fn from_raw(code: i32) -> OsError {
        OsError {
            code,
            message: Cow::Owned(io::Error::from_raw_os_error(code).to_string()),
        }
    }

    pub(crate) fn new_static(code: i32, message: &'static str) -> OsError {
        OsError {
            code,
            message: Cow::Borrowed(message),
        }
    }

    /// The OS error number, or -1 when the OS did not provide one.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Human readable description of the failure.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors produced while racing connections.
#[derive(Debug, Clone)]
pub enum Error {
    /// A required input was missing or out of range: empty hostname, port
    /// zero, or a second `connect` on the same race.
    InvalidArgument,
    /// Name resolution failed, or produced no usable address.
    Resolve(OsError),
    /// Setting up an attempt failed: socket creation or worker spawn.
    Resource(OsError),
    /// Every candidate failed. Carries the most common OS error among them.
    ConnectFailed(OsError),
    /// The race did not reach a terminal state within the wait budget.
    Timeout,
}

impl Error {
    /// The OS error code behind this error, or 0 when there is none.
    pub fn os_code(&self) -> i32 {
        match self {
            Error::InvalidArgument | Error::Timeout => 0,
            Error::Resolve(e) | Error::Resource(e) | Error::ConnectFailed(e) => e.code(),
        }
    }

    /// The OS-derived message behind this error, if any.
    pub fn os_message(&self) -> Option<&str> {
        match self {
            Error::InvalidArgument | Error::Timeout => None,
            Error::Resolve(e) | Error::Resource(e) | Error::ConnectFailed(e) => Some(e.message()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::Resolve(e) => write!(f, "name resolution failed: {}", e),
            Error::Resource(e) => write!(f, "failed to set up connection attempt: {}", e),
            Error::ConnectFailed(e) => write!(f, "all connection attempts failed: {}", e),
            Error::Timeout => write!(f, "timed out waiting for the connection race"),
        }
    }
}

impl std::error::Error for Error {}
