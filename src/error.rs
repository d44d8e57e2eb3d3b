// SPDX-License-Identifier: MPL-2.0

//! The error type shared across this crate.
//!
//! Mirrors the `Errno`/`Error` pair used elsewhere in this codebase rather
//! than reaching for an error-derive crate: construction is cheap, matching
//! is cheap, and a `Resource` error can still carry the raw OS errno that
//! produced it.

use std::fmt;

/// The coarse classification of a failure raised by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// A caller-supplied argument violates a documented precondition.
    InvalidArgument,
    /// No region (or no callback target) matches the request.
    NotFound,
    /// The request is well-formed but this controller does not support it.
    Unsupported,
    /// A host resource (fd, mapping, allocation) could not be obtained.
    Resource,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Errno::InvalidArgument => "invalid argument",
            Errno::NotFound => "not found",
            Errno::Unsupported => "unsupported",
            Errno::Resource => "resource error",
        };
        f.write_str(s)
    }
}

/// An error raised by this crate.
///
/// Carries an [`Errno`] classification, an optional static message for
/// diagnostics, and, for [`Errno::Resource`] failures, the raw OS errno
/// that produced it (so callers that need to inspect `ENOSPC` vs `EACCES`
/// still can).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
    os_errno: Option<i32>,
}

impl Error {
    /// Creates a new error with no message and no OS errno.
    pub const fn new(errno: Errno) -> Self {
        Self {
            errno,
            msg: None,
            os_errno: None,
        }
    }

    /// Creates a new error with an attached static message.
    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Self {
            errno,
            msg: Some(msg),
            os_errno: None,
        }
    }

    /// Creates a [`Errno::Resource`] error preserving the raw OS errno.
    pub const fn from_os_errno(os_errno: i32, msg: &'static str) -> Self {
        Self {
            errno: Errno::Resource,
            msg: Some(msg),
            os_errno: Some(os_errno),
        }
    }

    /// The error classification.
    pub const fn errno(&self) -> Errno {
        self.errno
    }

    /// The attached static message, if any.
    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }

    /// The raw OS errno that produced this error, if any.
    pub const fn os_errno(&self) -> Option<i32> {
        self.os_errno
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.msg, self.os_errno) {
            (Some(msg), Some(os_errno)) => write!(f, "{}: {} (os error {})", self.errno, msg, os_errno),
            (Some(msg), None) => write!(f, "{}: {}", self.errno, msg),
            (None, Some(os_errno)) => write!(f, "{} (os error {})", self.errno, os_errno),
            (None, None) => write!(f, "{}", self.errno),
        }
    }
}

impl std::error::Error for Error {}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error {
            errno: Errno::Resource,
            msg: Some("host syscall failed"),
            os_errno: Some(e as i32),
        }
    }
}

/// Shorthand for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Builds and returns an [`Error`] with [`Errno::InvalidArgument`] and the
/// given message.
macro_rules! invalid_arg {
    ($msg:expr) => {
        return Err($crate::error::Error::with_message(
            $crate::error::Errno::InvalidArgument,
            $msg,
        ))
    };
}

pub(crate) use invalid_arg;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_variants() {
        let e = Error::new(Errno::NotFound);
        assert_eq!(e.to_string(), "not found");

        let e = Error::with_message(Errno::Unsupported, "whole-region only");
        assert_eq!(e.to_string(), "unsupported: whole-region only");

        let e = Error::from_os_errno(12, "mmap failed");
        assert_eq!(e.os_errno(), Some(12));
        assert_eq!(e.errno(), Errno::Resource);
    }
}
