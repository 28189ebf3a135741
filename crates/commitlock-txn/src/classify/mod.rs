//! Classification of backend failures into typed locking errors.
//!
//! Backends report lock trouble natively: a lock wait timeout, a `NOWAIT`
//! rejection, or a deadlock victimisation. Which typed error the caller
//! sees depends only on the protocol phase the statement belonged to:
//!
//! ```text
//!                    │ Modify                   │ ReadCurrent
//! ───────────────────┼──────────────────────────┼───────────────────────────────
//!  LockWaitTimeout   │ UnableToLockRowsToModify │ UnableToLockRowsToReadCurrent
//!  LockNotAvailable  │ UnableToLockRowsToModify │ UnableToLockRowsToReadCurrent
//!  Deadlock          │ UnableToLockRowsToModify │ UnableToLockRowsToReadCurrent
//!  anything else     │ Backend                  │ Backend
//! ```
//!
//! Deadlocks keep the backend's detail, which always contains the word
//! "deadlock", so diagnostic tooling can recognise them.

use std::time::Duration;

use commitlock_common::types::{Oid, TxnId};
use commitlock_common::{BackendError, LockPhase, NativeErrorKind};
use tracing::{debug, warn};

use crate::connection::{ConflictKind, VersionConflict};
use crate::error::{CommitLockError, LockFailure};

/// Maps a backend failure raised while locking `oids` into a typed error.
///
/// A phase recorded on the error by the backend wins over `phase`.
pub fn classify_lock_error(
    txn_id: TxnId,
    phase: LockPhase,
    oids: &[Oid],
    error: BackendError,
    waited: Duration,
) -> CommitLockError {
    let phase = error.phase.unwrap_or(phase);

    let failure = match error.kind {
        NativeErrorKind::LockWaitTimeout => LockFailure::Timeout {
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        },
        NativeErrorKind::LockNotAvailable => LockFailure::NoWait,
        NativeErrorKind::Deadlock => {
            warn!(
                txn_id = %txn_id,
                %phase,
                detail = %error.message,
                "transaction chosen as deadlock victim"
            );
            LockFailure::Deadlock {
                detail: error.message,
            }
        }
        _ => {
            return CommitLockError::Backend {
                txn_id,
                source: error,
            }
        }
    };

    debug!(txn_id = %txn_id, %phase, %failure, rows = oids.len(), "lock failure");

    let oids = oids.to_vec();
    match phase {
        LockPhase::Modify => CommitLockError::UnableToLockRowsToModify {
            txn_id,
            oids,
            failure,
        },
        LockPhase::ReadCurrent => CommitLockError::UnableToLockRowsToReadCurrent {
            txn_id,
            oids,
            failure,
        },
    }
}

/// Maps a version conflict into a typed error.
pub fn classify_conflict(txn_id: TxnId, conflict: &VersionConflict) -> CommitLockError {
    debug!(
        txn_id = %txn_id,
        oid = %conflict.oid,
        expected = %conflict.expected,
        actual = %conflict.actual,
        kind = ?conflict.kind,
        "version conflict"
    );
    match conflict.kind {
        ConflictKind::ReadCurrent => CommitLockError::ReadConflict {
            txn_id,
            oid: conflict.oid,
            expected: conflict.expected,
            actual: conflict.actual,
        },
        ConflictKind::Write => CommitLockError::WriteConflict {
            txn_id,
            oid: conflict.oid,
            expected: conflict.expected,
            actual: conflict.actual,
        },
    }
}
