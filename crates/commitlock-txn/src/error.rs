//! Typed errors raised by the locking layer.
//!
//! Every lock or version failure raised during a vote is transaction
//! scoped and retryable: the caller aborts and may run the whole
//! transaction again.

use std::fmt;

use commitlock_common::types::{Oid, Tid, TxnId};
use commitlock_common::{BackendError, ErrorCode, DEADLOCK_MARKER};
use thiserror::Error;

use crate::coordinator::TransactionState;

/// Why a lock request lost arbitration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockFailure {
    /// The request waited until its timeout expired.
    Timeout {
        /// How long the statement waited, in milliseconds.
        waited_ms: u64,
    },
    /// A `NOWAIT` request found the row locked.
    NoWait,
    /// The backend's deadlock detector rolled this transaction back.
    Deadlock {
        /// Backend detail describing the cycle.
        detail: String,
    },
}

impl fmt::Display for LockFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockFailure::Timeout { waited_ms } => {
                write!(f, "lock wait timed out after {}ms", waited_ms)
            }
            LockFailure::NoWait => write!(f, "row is locked by another transaction (NOWAIT)"),
            LockFailure::Deadlock { detail } => write!(f, "{}: {}", DEADLOCK_MARKER, detail),
        }
    }
}

/// Errors raised by the commit coordinator and the locker.
#[derive(Debug, Error)]
pub enum CommitLockError {
    /// Exclusive locks for the write set could not be obtained.
    #[error("transaction {txn_id}: unable to lock rows to modify {oids:?}: {failure}")]
    UnableToLockRowsToModify {
        /// The transaction.
        txn_id: TxnId,
        /// The rows the statement tried to lock.
        oids: Vec<Oid>,
        /// Why the lock was not obtained.
        failure: LockFailure,
    },

    /// Shared locks for read-current assertions could not be obtained.
    #[error("transaction {txn_id}: unable to lock rows to read current {oids:?}: {failure}")]
    UnableToLockRowsToReadCurrent {
        /// The transaction.
        txn_id: TxnId,
        /// The rows the statement tried to lock.
        oids: Vec<Oid>,
        /// Why the lock was not obtained.
        failure: LockFailure,
    },

    /// A read-current assertion no longer holds.
    #[error(
        "transaction {txn_id}: read conflict on object {oid}: expected serial {expected}, current serial {actual}"
    )]
    ReadConflict {
        /// The transaction.
        txn_id: TxnId,
        /// The object.
        oid: Oid,
        /// The asserted version.
        expected: Tid,
        /// The version committed at the time of the check.
        actual: Tid,
    },

    /// A stored object changed since the transaction read it.
    #[error(
        "transaction {txn_id}: write conflict on object {oid}: expected serial {expected}, current serial {actual}"
    )]
    WriteConflict {
        /// The transaction.
        txn_id: TxnId,
        /// The object.
        oid: Oid,
        /// The version the store was based on.
        expected: Tid,
        /// The version committed at the time of the check.
        actual: Tid,
    },

    /// Transaction not found.
    #[error("transaction {txn_id} not found")]
    TransactionNotFound {
        /// The missing transaction.
        txn_id: TxnId,
    },

    /// Transaction is not in the expected state.
    #[error("transaction {txn_id} in invalid state {current}, expected {expected}")]
    InvalidState {
        /// The transaction.
        txn_id: TxnId,
        /// The current state.
        current: TransactionState,
        /// The expected state(s).
        expected: &'static str,
    },

    /// Any other backend failure.
    #[error("transaction {txn_id}: backend error: {source}")]
    Backend {
        /// The transaction.
        txn_id: TxnId,
        /// The backend error.
        #[source]
        source: BackendError,
    },
}

/// Result type for locking-layer operations.
pub type TxnResult<T> = Result<T, CommitLockError>;

impl CommitLockError {
    /// Returns the error code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnableToLockRowsToModify { .. } => ErrorCode::ModifyLockTimeout,
            Self::UnableToLockRowsToReadCurrent { .. } => ErrorCode::ReadCurrentLockConflict,
            Self::ReadConflict { .. } => ErrorCode::ReadConflict,
            Self::WriteConflict { .. } => ErrorCode::WriteConflict,
            Self::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::Backend { source, .. } => source.code(),
        }
    }

    /// Returns the transaction the error belongs to.
    #[must_use]
    pub fn txn_id(&self) -> TxnId {
        match self {
            Self::UnableToLockRowsToModify { txn_id, .. }
            | Self::UnableToLockRowsToReadCurrent { txn_id, .. }
            | Self::ReadConflict { txn_id, .. }
            | Self::WriteConflict { txn_id, .. }
            | Self::TransactionNotFound { txn_id }
            | Self::InvalidState { txn_id, .. }
            | Self::Backend { txn_id, .. } => *txn_id,
        }
    }

    /// Returns true if aborting and re-running the transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnableToLockRowsToModify { .. }
            | Self::UnableToLockRowsToReadCurrent { .. }
            | Self::ReadConflict { .. }
            | Self::WriteConflict { .. } => true,
            Self::Backend { source, .. } => source.kind.is_lock_failure(),
            Self::TransactionNotFound { .. } | Self::InvalidState { .. } => false,
        }
    }

    /// Returns true if the backend chose this transaction as a deadlock victim.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        match self {
            Self::UnableToLockRowsToModify { failure, .. }
            | Self::UnableToLockRowsToReadCurrent { failure, .. } => {
                matches!(failure, LockFailure::Deadlock { .. })
            }
            Self::Backend { source, .. } => source.is_deadlock(),
            _ => false,
        }
    }

    /// Returns true for version conflicts (as opposed to lock contention).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ReadConflict { .. } | Self::WriteConflict { .. })
    }

    /// Returns true if the transaction's read view is stale.
    ///
    /// Callers may prefer to refresh state rather than retry blindly.
    #[must_use]
    pub fn is_stale_read(&self) -> bool {
        matches!(self, Self::ReadConflict { .. })
    }

    /// Returns the lock failure, if this is a lock arbitration error.
    #[must_use]
    pub fn lock_failure(&self) -> Option<&LockFailure> {
        match self {
            Self::UnableToLockRowsToModify { failure, .. }
            | Self::UnableToLockRowsToReadCurrent { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commitlock_common::NativeErrorKind;

    fn txn() -> TxnId {
        TxnId::new(7)
    }

    #[test]
    fn test_error_codes() {
        let err = CommitLockError::UnableToLockRowsToModify {
            txn_id: txn(),
            oids: vec![Oid::new(1)],
            failure: LockFailure::Timeout { waited_ms: 100 },
        };
        assert_eq!(err.code(), ErrorCode::ModifyLockTimeout);
        assert_eq!(err.code().category(), "Transaction");
        assert_eq!(err.txn_id(), txn());
    }

    #[test]
    fn test_retryable() {
        let lock = CommitLockError::UnableToLockRowsToReadCurrent {
            txn_id: txn(),
            oids: vec![Oid::new(2)],
            failure: LockFailure::NoWait,
        };
        assert!(lock.is_retryable());
        assert!(!lock.is_conflict());

        let stale = CommitLockError::ReadConflict {
            txn_id: txn(),
            oid: Oid::new(2),
            expected: Tid::new(1),
            actual: Tid::new(2),
        };
        assert!(stale.is_retryable());
        assert!(stale.is_stale_read());

        let state = CommitLockError::InvalidState {
            txn_id: txn(),
            current: TransactionState::Finished,
            expected: "Voted",
        };
        assert!(!state.is_retryable());
        assert!(!CommitLockError::TransactionNotFound { txn_id: txn() }.is_retryable());
    }

    #[test]
    fn test_deadlock_marker_in_message() {
        let err = CommitLockError::UnableToLockRowsToReadCurrent {
            txn_id: txn(),
            oids: vec![Oid::new(1)],
            failure: LockFailure::Deadlock {
                detail: "session-1 waits for session-2".into(),
            },
        };
        assert!(err.is_deadlock());
        assert!(err.to_string().to_lowercase().contains("deadlock"));
    }

    #[test]
    fn test_backend_error_passthrough() {
        let err = CommitLockError::Backend {
            txn_id: txn(),
            source: BackendError::new(NativeErrorKind::Closed, "gone"),
        };
        assert_eq!(err.code(), ErrorCode::Closed);
        assert!(!err.is_retryable());
        assert!(err.lock_failure().is_none());
    }
}
