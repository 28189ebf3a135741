//! The vote-time locking protocol.
//!
//! The [`Locker`] owns the two halves of the protocol:
//!
//! 1. [`Locker::lock_for_write`] takes exclusive locks on every row in the
//!    write set, waiting at most the commit lock timeout.
//! 2. [`Locker::validate_read_current`] takes shared locks on the rows the
//!    transaction only asserted to be current and compares their committed
//!    versions with the asserted ones.
//!
//! Exclusive locks always come first. A transaction that merely read a row
//! another transaction is modifying then fails fast with a read-current
//! conflict instead of queueing behind write locks.
//!
//! The halves are separately callable so a caller (or a test) can suspend
//! between them; [`crate::strategy`] decides whether they run as two round
//! trips or as one server-side call.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use commitlock_common::config::CommitLockConfig;
use commitlock_common::types::{Oid, Tid, TxnId};
use commitlock_common::LockPhase;
use tracing::{debug, trace};

use crate::classify::{classify_conflict, classify_lock_error};
use crate::connection::{BackendCapabilities, ConflictKind, Connection, LockWait, VersionConflict};
use crate::error::TxnResult;

/// Object id to version token.
pub type VersionMap = BTreeMap<Oid, Tid>;

/// Executes the locking protocol against one connection at a time.
#[derive(Debug, Clone)]
pub struct Locker {
    /// Bound on exclusive lock waits (and shared waits without NOWAIT).
    commit_lock_timeout: Duration,
    /// Whether the backend accepts NOWAIT on shared locks.
    supports_row_lock_nowait: bool,
    /// Configuration override disabling NOWAIT.
    force_shared_lock_blocking: bool,
}

impl Locker {
    /// Creates a locker from configuration and backend capabilities.
    pub fn new(config: &CommitLockConfig, capabilities: BackendCapabilities) -> Self {
        Self {
            commit_lock_timeout: config.commit_lock_timeout(),
            supports_row_lock_nowait: capabilities.supports_row_lock_nowait,
            force_shared_lock_blocking: config.force_shared_lock_blocking,
        }
    }

    /// Returns the commit lock timeout.
    pub fn commit_lock_timeout(&self) -> Duration {
        self.commit_lock_timeout
    }

    /// Changes the commit lock timeout.
    pub fn set_commit_lock_timeout(&mut self, timeout: Duration) {
        self.commit_lock_timeout = timeout;
    }

    /// Forces (or stops forcing) blocking read-current locks.
    pub fn set_force_shared_lock_blocking(&mut self, enabled: bool) {
        self.force_shared_lock_blocking = enabled;
    }

    /// Returns true if the backend accepts NOWAIT on shared locks.
    pub fn supports_row_lock_nowait(&self) -> bool {
        self.supports_row_lock_nowait
    }

    /// Returns true if read-current validation uses NOWAIT by default.
    pub fn use_nowait(&self) -> bool {
        self.supports_row_lock_nowait && !self.force_shared_lock_blocking
    }

    /// Returns the wait mode for shared locks.
    ///
    /// NOWAIT is only used when both asked for and supported; otherwise the
    /// request blocks up to the commit lock timeout.
    pub fn shared_lock_wait(&self, use_nowait: bool) -> LockWait {
        if use_nowait && self.supports_row_lock_nowait {
            LockWait::NoWait
        } else {
            LockWait::Timeout(self.commit_lock_timeout)
        }
    }

    /// Takes exclusive locks on `oids` and returns their committed versions.
    ///
    /// Must run before [`Locker::validate_read_current`] for the same
    /// transaction. An empty set succeeds without touching the backend.
    pub fn lock_for_write(
        &self,
        conn: &mut dyn Connection,
        txn_id: TxnId,
        oids: &[Oid],
    ) -> TxnResult<VersionMap> {
        if oids.is_empty() {
            return Ok(VersionMap::new());
        }

        let started = Instant::now();
        let rows = conn
            .lock_rows_exclusive(oids, self.commit_lock_timeout)
            .map_err(|e| {
                classify_lock_error(txn_id, LockPhase::Modify, oids, e, started.elapsed())
            })?;

        debug!(
            txn_id = %txn_id,
            session = %conn.session_id(),
            rows = oids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "locked rows to modify"
        );

        Ok(rows
            .into_iter()
            .map(|(oid, tid)| (oid, Tid::from(tid)))
            .collect())
    }

    /// Validates read-current assertions under shared locks.
    ///
    /// With `use_nowait` (and backend support) a row locked by another
    /// transaction fails immediately; otherwise the statement blocks up to
    /// the commit lock timeout. A version mismatch is always an error.
    pub fn validate_read_current(
        &self,
        conn: &mut dyn Connection,
        txn_id: TxnId,
        expected: &VersionMap,
        use_nowait: bool,
    ) -> TxnResult<()> {
        if expected.is_empty() {
            return Ok(());
        }

        let oids: Vec<Oid> = expected.keys().copied().collect();
        let wait = self.shared_lock_wait(use_nowait);
        let started = Instant::now();
        let rows = conn.lock_rows_shared(&oids, wait).map_err(|e| {
            classify_lock_error(txn_id, LockPhase::ReadCurrent, &oids, e, started.elapsed())
        })?;

        let current: VersionMap = rows
            .into_iter()
            .map(|(oid, tid)| (oid, Tid::from(tid)))
            .collect();

        trace!(txn_id = %txn_id, %wait, rows = oids.len(), "validated read-current rows");

        match find_conflicts(expected, &current, ConflictKind::ReadCurrent).first() {
            Some(conflict) => Err(classify_conflict(txn_id, conflict)),
            None => Ok(()),
        }
    }
}

/// Compares expected versions with current ones.
///
/// A row missing from `current` counts as never committed (`Tid::ZERO`).
pub fn find_conflicts(
    expected: &VersionMap,
    current: &VersionMap,
    kind: ConflictKind,
) -> Vec<VersionConflict> {
    expected
        .iter()
        .filter_map(|(&oid, &expected)| {
            let actual = current.get(&oid).copied().unwrap_or(Tid::ZERO);
            (actual != expected).then_some(VersionConflict {
                oid,
                expected,
                actual,
                kind,
            })
        })
        .collect()
}
