//! Filepath: src/error.rs
//!
//! Errors surfaced by the database facade and the transaction layer.
//!
//! Tree-level OLC conflicts never appear here: they are absorbed by the
//! restart loops in [`crate::tree`].

use std::fmt as StdFmt;

use crate::config::MAX_KEY_SIZE;

/// Error returned by record and database operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The key has no visible version (never written, or deleted).
    KeyNotExist,

    /// Another active transaction holds a conflicting latch on the record.
    ///
    /// Nothing was modified. The caller decides whether to retry.
    FailByActiveTxn,

    /// The key exceeds [`MAX_KEY_SIZE`].
    KeyTooLarge {
        /// Length of the rejected key.
        len: usize,

        /// Maximum accepted length.
        max: usize,
    },

    /// A write was attempted through a read-only transaction.
    ReadOnlyTransaction,
}

impl Error {
    /// Build a [`Error::KeyTooLarge`] for a key of `len` bytes.
    #[must_use]
    pub const fn key_too_large(len: usize) -> Self {
        Self::KeyTooLarge {
            len,
            max: MAX_KEY_SIZE,
        }
    }
}

impl StdFmt::Display for Error {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::KeyNotExist => write!(f, "key does not exist"),
            Self::FailByActiveTxn => {
                write!(f, "record is latched by another active transaction")
            }
            Self::KeyTooLarge { len, max } => {
                write!(f, "key of {len} bytes exceeds the {max} byte limit")
            }
            Self::ReadOnlyTransaction => write!(f, "write through a read-only transaction"),
        }
    }
}

impl std::error::Error for Error {}

/// Three-valued outcome of a record operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation took effect.
    Success,

    /// No visible version of the key exists.
    KeyNotExist,

    /// A conflicting latch is held by another transaction.
    FailByActiveTxn,
}

impl Status {
    /// Collapse a result onto the status taxonomy.
    ///
    /// Argument errors (`KeyTooLarge`, `ReadOnlyTransaction`) are not record
    /// outcomes and map to `None`.
    #[must_use]
    pub const fn of<T>(result: &Result<T, Error>) -> Option<Self> {
        match result {
            Ok(_) => Some(Self::Success),
            Err(Error::KeyNotExist) => Some(Self::KeyNotExist),
            Err(Error::FailByActiveTxn) => Some(Self::FailByActiveTxn),
            Err(Error::KeyTooLarge { .. } | Error::ReadOnlyTransaction) => None,
        }
    }

    /// True for [`Status::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::KeyNotExist.to_string(), "key does not exist");
        assert_eq!(
            Error::key_too_large(300).to_string(),
            "key of 300 bytes exceeds the 256 byte limit"
        );
    }

    #[test]
    fn test_status_of() {
        assert_eq!(Status::of::<()>(&Ok(())), Some(Status::Success));
        assert_eq!(
            Status::of::<()>(&Err(Error::KeyNotExist)),
            Some(Status::KeyNotExist)
        );
        assert_eq!(
            Status::of::<()>(&Err(Error::FailByActiveTxn)),
            Some(Status::FailByActiveTxn)
        );
        assert_eq!(Status::of::<()>(&Err(Error::ReadOnlyTransaction)), None);
        assert!(Status::Success.is_success());
        assert!(!Status::KeyNotExist.is_success());
    }
}
