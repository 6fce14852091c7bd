//! Error Codes
//!
//! Every fallible operation of the runtime reports a POSIX errno kind. The
//! [`Error`] enum names the kinds the core produces itself and carries any
//! other OS value verbatim, so an error can always be turned back into the
//! integer code it stands for.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `NoMemory` | `ENOMEM` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NoData` | `ENODATA` |
//! | `Protocol` | `EPROTO` |
//! | `Busy` | `EBUSY` |
//! | `Invariant` | `EINVARIANT` (256) |
//! | `Errno(n)` | `n` |

use nix::errno::Errno;
use nix::libc;
use thiserror::Error;

/// Error code for a detected internal invariant violation (memory corruption).
pub const EINVARIANT: i32 = 256;

/// Largest error code with an entry in the error string table.
pub const MAX_ERRNO: i32 = 511;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Error {
    /// OS mapping failed or heap exhausted.
    #[error("out of memory")]
    NoMemory,
    /// Precondition violation.
    #[error("invalid argument")]
    InvalidArgument,
    /// A read-only lookup found a missing node.
    #[error("no data available")]
    NoData,
    /// Operation attempted in the wrong lifecycle phase.
    #[error("operation not allowed in current lifecycle state")]
    Protocol,
    /// Resource is in use.
    #[error("resource busy")]
    Busy,
    /// Detected corruption.
    #[error("internal invariant violated")]
    Invariant,
    /// Any other errno value.
    #[error("{}", describe(*.0))]
    Errno(i32),
}

impl Error {
    /// Map an errno value to an error.
    pub fn from_errno(code: i32) -> Self {
        match code {
            libc::ENOMEM => Error::NoMemory,
            libc::EINVAL => Error::InvalidArgument,
            libc::ENODATA => Error::NoData,
            libc::EPROTO => Error::Protocol,
            libc::EBUSY => Error::Busy,
            EINVARIANT => Error::Invariant,
            other => Error::Errno(other),
        }
    }

    /// The errno value of this error.
    pub fn errno(&self) -> i32 {
        match *self {
            Error::NoMemory => libc::ENOMEM,
            Error::InvalidArgument => libc::EINVAL,
            Error::NoData => libc::ENODATA,
            Error::Protocol => libc::EPROTO,
            Error::Busy => libc::EBUSY,
            Error::Invariant => EINVARIANT,
            Error::Errno(code) => code,
        }
    }

    /// Error of the last failed system call on this thread.
    pub fn last_os_error() -> Self {
        Error::from(Errno::last())
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::from_errno(errno as i32)
    }
}

/// Keeps the first error of a sequence of teardown steps.
///
/// Teardown continues after a failing step; only the first failure is
/// reported to the caller.
pub(crate) fn keep_first(first: &mut Option<Error>, result: Result<()>) {
    if let Err(err) = result {
        first.get_or_insert(err);
    }
}

fn describe(code: i32) -> String {
    if code == EINVARIANT {
        return "internal invariant violated".to_string();
    }
    let clamped = code.clamp(0, MAX_ERRNO);
    format!("{} (errno {})", Errno::from_raw(clamped).desc(), code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_roundtrip_of_named_kinds() {
        for err in [
            Error::NoMemory,
            Error::InvalidArgument,
            Error::NoData,
            Error::Protocol,
            Error::Busy,
            Error::Invariant,
        ] {
            assert_eq!(Error::from_errno(err.errno()), err);
        }
    }

    #[test]
    fn test_unnamed_errno_is_kept() {
        let err = Error::from_errno(3);
        assert_eq!(err, Error::Errno(3));
        assert_eq!(err.errno(), 3);
        assert!(err.to_string().contains("errno 3"));
    }

    #[test]
    fn test_einvariant_value() {
        assert_eq!(EINVARIANT, 256);
        assert_eq!(Error::Invariant.errno(), 256);
    }

    #[test]
    fn test_keep_first() {
        let mut first = None;
        keep_first(&mut first, Ok(()));
        assert_eq!(first, None);
        keep_first(&mut first, Err(Error::Busy));
        keep_first(&mut first, Err(Error::NoMemory));
        assert_eq!(first, Some(Error::Busy));
    }

    #[test]
    fn test_from_nix_errno() {
        assert_eq!(Error::from(Errno::ENOMEM), Error::NoMemory);
        assert_eq!(Error::from(Errno::EACCES), Error::Errno(libc::EACCES));
    }
}
