// SPDX-License-Identifier: GPL-2.0 OR MIT

//! Kernel errors.
//!
//! Errors are carried as a typed enum, one variant per errno the driver stack can produce. The
//! [`code`] module exposes them under their C names so that call sites read as
//! `return Err(EINVAL)`.

use thiserror::Error as ThisError;

/// Generic integer kernel error.
///
/// Each variant corresponds to a single errno value, see [`Error::to_errno`].
#[derive(ThisError, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// Operation not permitted.
    #[error("EPERM: operation not permitted")]
    PermissionDenied,
    /// No such file or directory (used for unknown handles).
    #[error("ENOENT: no such entry")]
    NotFound,
    /// I/O error.
    #[error("EIO: I/O error")]
    Io,
    /// Try again.
    #[error("EAGAIN: try again")]
    Again,
    /// Out of memory.
    #[error("ENOMEM: out of memory")]
    NoMemory,
    /// Bad address.
    #[error("EFAULT: bad address")]
    Fault,
    /// Device or resource busy.
    #[error("EBUSY: device or resource busy")]
    Busy,
    /// No such device.
    #[error("ENODEV: no such device")]
    NoDevice,
    /// Invalid argument.
    #[error("EINVAL: invalid argument")]
    InvalidArgument,
    /// No space left on device.
    #[error("ENOSPC: no space left")]
    NoSpace,
    /// Resource deadlock would occur.
    #[error("EDEADLK: resource deadlock would occur")]
    Deadlock,
    /// Operation already in progress.
    #[error("EALREADY: operation already in progress")]
    Already,
    /// Connection timed out.
    #[error("ETIMEDOUT: timed out")]
    Timeout,
    /// Interrupted system call, restart.
    #[error("ERESTARTSYS: interrupted")]
    RestartSys,
}

impl Error {
    /// Returns the error encoded as a negative errno value.
    pub fn to_errno(self) -> i32 {
        match self {
            Error::PermissionDenied => -1,
            Error::NotFound => -2,
            Error::Io => -5,
            Error::Again => -11,
            Error::NoMemory => -12,
            Error::Fault => -14,
            Error::Busy => -16,
            Error::NoDevice => -19,
            Error::InvalidArgument => -22,
            Error::NoSpace => -28,
            Error::Deadlock => -35,
            Error::Already => -114,
            Error::Timeout => -110,
            Error::RestartSys => -512,
        }
    }

    /// Creates an [`Error`] from a negative errno value.
    ///
    /// Unknown values map to `EINVAL`.
    pub fn from_errno(errno: i32) -> Error {
        match errno {
            -1 => Error::PermissionDenied,
            -2 => Error::NotFound,
            -5 => Error::Io,
            -11 => Error::Again,
            -12 => Error::NoMemory,
            -14 => Error::Fault,
            -16 => Error::Busy,
            -19 => Error::NoDevice,
            -28 => Error::NoSpace,
            -35 => Error::Deadlock,
            -110 => Error::Timeout,
            -114 => Error::Already,
            -512 => Error::RestartSys,
            _ => Error::InvalidArgument,
        }
    }

    /// Returns `true` if the caller may simply retry the operation.
    pub fn is_retryable(self) -> bool {
        matches!(self, Error::RestartSys | Error::Again | Error::Deadlock)
    }

    /// Returns the C name of the errno.
    pub fn name(self) -> &'static str {
        match self {
            Error::PermissionDenied => "EPERM",
            Error::NotFound => "ENOENT",
            Error::Io => "EIO",
            Error::Again => "EAGAIN",
            Error::NoMemory => "ENOMEM",
            Error::Fault => "EFAULT",
            Error::Busy => "EBUSY",
            Error::NoDevice => "ENODEV",
            Error::InvalidArgument => "EINVAL",
            Error::NoSpace => "ENOSPC",
            Error::Deadlock => "EDEADLK",
            Error::Already => "EALREADY",
            Error::Timeout => "ETIMEDOUT",
            Error::RestartSys => "ERESTARTSYS",
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Error {
        Error::NoMemory
    }
}

impl From<core::num::TryFromIntError> for Error {
    fn from(_: core::num::TryFromIntError) -> Error {
        Error::InvalidArgument
    }
}

/// Contains the C-compatible error codes.
pub mod code {
    use super::Error;

    /// Operation not permitted.
    pub const EPERM: Error = Error::PermissionDenied;
    /// No such file or directory.
    pub const ENOENT: Error = Error::NotFound;
    /// I/O error.
    pub const EIO: Error = Error::Io;
    /// Try again.
    pub const EAGAIN: Error = Error::Again;
    /// Out of memory.
    pub const ENOMEM: Error = Error::NoMemory;
    /// Bad address.
    pub const EFAULT: Error = Error::Fault;
    /// Device or resource busy.
    pub const EBUSY: Error = Error::Busy;
    /// No such device.
    pub const ENODEV: Error = Error::NoDevice;
    /// Invalid argument.
    pub const EINVAL: Error = Error::InvalidArgument;
    /// No space left on device.
    pub const ENOSPC: Error = Error::NoSpace;
    /// Resource deadlock would occur.
    pub const EDEADLK: Error = Error::Deadlock;
    /// Operation already in progress.
    pub const EALREADY: Error = Error::Already;
    /// Connection timed out.
    pub const ETIMEDOUT: Error = Error::Timeout;
    /// Interrupted system call, restart.
    pub const ERESTARTSYS: Error = Error::RestartSys;
}

/// A [`Result`] with an [`Error`] error type.
///
/// To be used as the return type for functions that may fail.
pub type Result<T = ()> = core::result::Result<T, Error>;

/// Converts an integer as returned by a C-style call into a [`Result`].
pub fn to_result(err: i32) -> Result {
    if err < 0 {
        Err(Error::from_errno(err))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::code::*;
    use super::*;

    #[test]
    fn errno_roundtrip() {
        for e in [EINVAL, ENOENT, ENOSPC, EDEADLK, ERESTARTSYS, ETIMEDOUT, EBUSY] {
            assert_eq!(Error::from_errno(e.to_errno()), e);
        }
        assert_eq!(to_result(0), Ok(()));
        assert_eq!(to_result(-28), Err(ENOSPC));
    }

    #[test]
    fn retryable() {
        assert!(ERESTARTSYS.is_retryable());
        assert!(EDEADLK.is_retryable());
        assert!(!EINVAL.is_retryable());
        assert_eq!(ENOSPC.name(), "ENOSPC");
    }
}
