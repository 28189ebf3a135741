//! Backend error types.
//!
//! A backend reports failures the way a relational server does: a native
//! error kind plus a human readable message. The transaction layer
//! classifies these into its own typed errors.

use std::fmt;
use thiserror::Error;

use crate::constants::DEADLOCK_MARKER;

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Operation not supported.
    NotSupported = 0x0002,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,
    /// Connection or session is closed.
    Closed = 0x0004,

    // Lock errors (0x0100 - 0x01FF)
    /// A lock wait exceeded its timeout.
    LockWaitTimeout = 0x0100,
    /// A NOWAIT lock request found a conflicting holder.
    LockNotAvailable = 0x0101,
    /// The backend chose this session as a deadlock victim.
    Deadlock = 0x0102,
    /// A row was written without holding its exclusive lock.
    NotLocked = 0x0103,

    // Transaction errors (0x0200 - 0x02FF)
    /// The session's transaction was aborted by the backend.
    TransactionAborted = 0x0200,
    /// Exclusive locks for the write set could not be obtained.
    ModifyLockTimeout = 0x0201,
    /// Shared locks for read-current assertions could not be obtained.
    ReadCurrentLockConflict = 0x0202,
    /// An asserted read-current version is no longer current.
    ReadConflict = 0x0203,
    /// A stored object was changed since it was read.
    WriteConflict = 0x0204,
    /// Transaction not found.
    TransactionNotFound = 0x0205,
    /// Transaction is not in a state that allows the operation.
    InvalidState = 0x0206,

    // Configuration errors (0x0300 - 0x03FF)
    /// Configuration file could not be read or written.
    ConfigIo = 0x0300,
    /// Configuration could not be parsed.
    ConfigParse = 0x0301,
    /// Configuration is invalid.
    InvalidConfig = 0x0302,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "Lock",
            0x02 => "Transaction",
            0x03 => "Config",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Native failure kinds reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeErrorKind {
    /// A blocking lock request exceeded the statement's lock timeout.
    LockWaitTimeout,
    /// A NOWAIT lock request found the row locked.
    LockNotAvailable,
    /// The deadlock detector rolled back this session's transaction.
    Deadlock,
    /// The session's transaction is aborted; only rollback is accepted.
    TransactionAborted,
    /// A write touched a row the session has not locked exclusively.
    NotLocked,
    /// The backend lacks the requested feature.
    NotSupported,
    /// The session has been closed.
    Closed,
    /// Anything else.
    Internal,
}

impl NativeErrorKind {
    /// Returns the stable error code for this kind.
    #[must_use]
    pub const fn code(self) -> ErrorCode {
        match self {
            Self::LockWaitTimeout => ErrorCode::LockWaitTimeout,
            Self::LockNotAvailable => ErrorCode::LockNotAvailable,
            Self::Deadlock => ErrorCode::Deadlock,
            Self::TransactionAborted => ErrorCode::TransactionAborted,
            Self::NotLocked => ErrorCode::NotLocked,
            Self::NotSupported => ErrorCode::NotSupported,
            Self::Closed => ErrorCode::Closed,
            Self::Internal => ErrorCode::Internal,
        }
    }

    /// Returns true for lock arbitration failures (timeout, NOWAIT, deadlock).
    #[must_use]
    pub const fn is_lock_failure(self) -> bool {
        matches!(
            self,
            Self::LockWaitTimeout | Self::LockNotAvailable | Self::Deadlock
        )
    }
}

impl fmt::Display for NativeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockWaitTimeout => write!(f, "lock wait timeout exceeded"),
            Self::LockNotAvailable => write!(f, "could not obtain lock on row"),
            Self::Deadlock => write!(f, "{}", DEADLOCK_MARKER),
            Self::TransactionAborted => write!(f, "current transaction is aborted"),
            Self::NotLocked => write!(f, "row is not locked for update"),
            Self::NotSupported => write!(f, "feature not supported"),
            Self::Closed => write!(f, "session is closed"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

/// Which half of the vote-time locking protocol a statement belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockPhase {
    /// Exclusive locks on rows being modified.
    Modify,
    /// Shared locks on rows asserted to be read-current.
    ReadCurrent,
}

impl fmt::Display for LockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockPhase::Modify => write!(f, "modify"),
            LockPhase::ReadCurrent => write!(f, "read-current"),
        }
    }
}

/// An error raised by a backend session.
///
/// `phase` is filled in by compound statements that span both halves of
/// the locking protocol, so the caller can tell which half failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    /// Native failure kind.
    pub kind: NativeErrorKind,
    /// Human readable detail.
    pub message: String,
    /// Protocol phase, when the backend knows it.
    pub phase: Option<LockPhase>,
}

impl BackendError {
    /// Creates a new backend error.
    #[must_use]
    pub fn new(kind: NativeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            phase: None,
        }
    }

    /// Tags the error with the protocol phase it occurred in.
    #[must_use]
    pub fn in_phase(mut self, phase: LockPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.kind.code()
    }

    /// Returns true if the backend reported a deadlock.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        self.kind == NativeErrorKind::Deadlock
    }

    /// Creates a not-supported error.
    #[must_use]
    pub fn not_supported(feature: impl Into<String>) -> Self {
        Self::new(NativeErrorKind::NotSupported, feature)
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(NativeErrorKind::Internal, message)
    }
}
