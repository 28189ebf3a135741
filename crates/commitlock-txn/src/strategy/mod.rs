//! Lock strategies: how the two halves of the protocol reach the backend.
//!
//! - [`AtomicStrategy`] hands the whole write set and assertion set to the
//!   backend's lock-and-detect primitive in a single round trip.
//! - [`InterleavedStrategy`] issues the exclusive statement and the shared
//!   statement separately, comparing versions on the client.
//!
//! Both keep exclusive-before-shared ordering and are observably
//! equivalent for well-behaved schedules. The strategy is picked once, when
//! the coordinator is set up, by [`select_strategy`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use commitlock_common::config::CommitLockConfig;
use commitlock_common::types::{Oid, Tid, TxnId};
use commitlock_common::LockPhase;
use tracing::debug;

use crate::classify::{classify_conflict, classify_lock_error};
use crate::connection::{BackendCapabilities, ConflictKind, Connection};
use crate::error::TxnResult;
use crate::locker::{find_conflicts, Locker, VersionMap};

/// Identifies a strategy implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// One server-side call.
    Atomic,
    /// Two client-issued statements.
    Interleaved,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Atomic => write!(f, "atomic"),
            StrategyKind::Interleaved => write!(f, "interleaved"),
        }
    }
}

/// Everything a strategy needs to lock and validate one transaction.
#[derive(Debug, Clone, Copy)]
pub struct VoteRequest<'a> {
    /// The voting transaction.
    pub txn_id: TxnId,
    /// Rows being modified, with the version each store was based on.
    pub writes: &'a VersionMap,
    /// Read-current assertions.
    pub read_current: &'a VersionMap,
}

impl VoteRequest<'_> {
    /// Returns true if there is nothing to lock.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.read_current.is_empty()
    }

    /// Splits the assertions into those covered by the write set and the rest.
    ///
    /// A covered assertion is satisfied by the exclusive lock; it needs no
    /// shared request of its own.
    pub fn split_read_current(&self) -> (VersionMap, VersionMap) {
        self.read_current
            .iter()
            .map(|(&oid, &tid)| (oid, tid))
            .partition(|(oid, _)| self.writes.contains_key(oid))
    }
}

/// A policy for executing the locking protocol.
pub trait LockStrategy: Send + Sync + fmt::Debug {
    /// Returns which strategy this is.
    fn kind(&self) -> StrategyKind;

    /// Locks the write set, validates the assertion set, and reports the
    /// first conflict as an error.
    fn lock_and_validate(
        &self,
        locker: &Locker,
        conn: &mut dyn Connection,
        request: &VoteRequest<'_>,
    ) -> TxnResult<()>;
}

/// Two separate statements, exclusive then shared.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterleavedStrategy;

impl InterleavedStrategy {
    /// Runs only the exclusive half and checks write conflicts.
    ///
    /// Returns the assertions still to validate with shared locks.
    pub fn lock_rows_being_modified(
        &self,
        locker: &Locker,
        conn: &mut dyn Connection,
        request: &VoteRequest<'_>,
    ) -> TxnResult<VersionMap> {
        let oids: Vec<Oid> = request.writes.keys().copied().collect();
        let current = locker.lock_for_write(conn, request.txn_id, &oids)?;

        let (covered, remaining) = request.split_read_current();
        let first = find_conflicts(request.writes, &current, ConflictKind::Write)
            .into_iter()
            .chain(find_conflicts(&covered, &current, ConflictKind::ReadCurrent))
            .next();
        if let Some(conflict) = first {
            return Err(classify_conflict(request.txn_id, &conflict));
        }

        Ok(remaining)
    }
}

impl LockStrategy for InterleavedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Interleaved
    }

    fn lock_and_validate(
        &self,
        locker: &Locker,
        conn: &mut dyn Connection,
        request: &VoteRequest<'_>,
    ) -> TxnResult<()> {
        let remaining = self.lock_rows_being_modified(locker, conn, request)?;
        locker.validate_read_current(conn, request.txn_id, &remaining, locker.use_nowait())
    }
}

/// One server-side lock-and-detect call.
#[derive(Debug, Default, Clone, Copy)]
pub struct AtomicStrategy;

impl LockStrategy for AtomicStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Atomic
    }

    fn lock_and_validate(
        &self,
        locker: &Locker,
        conn: &mut dyn Connection,
        request: &VoteRequest<'_>,
    ) -> TxnResult<()> {
        if request.is_empty() {
            return Ok(());
        }

        let modify: Vec<(Oid, Tid)> = request.writes.iter().map(|(&o, &t)| (o, t)).collect();
        let read_current: Vec<(Oid, Tid)> =
            request.read_current.iter().map(|(&o, &t)| (o, t)).collect();

        let started = Instant::now();
        let conflicts = conn
            .lock_and_detect_conflicts(
                &modify,
                &read_current,
                locker.commit_lock_timeout(),
                locker.shared_lock_wait(locker.use_nowait()),
            )
            .map_err(|e| {
                let phase = e.phase.unwrap_or(LockPhase::Modify);
                let oids: Vec<Oid> = match phase {
                    LockPhase::Modify => modify.iter().map(|(o, _)| *o).collect(),
                    LockPhase::ReadCurrent => read_current.iter().map(|(o, _)| *o).collect(),
                };
                classify_lock_error(request.txn_id, phase, &oids, e, started.elapsed())
            })?;

        debug!(
            txn_id = %request.txn_id,
            session = %conn.session_id(),
            conflicts = conflicts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "lock_and_detect_conflicts"
        );

        match conflicts.first() {
            Some(conflict) => Err(classify_conflict(request.txn_id, conflict)),
            None => Ok(()),
        }
    }
}

/// Picks the strategy for a backend and configuration.
///
/// The atomic primitive is used whenever the backend has one, unless the
/// configuration forces the interleavable path.
pub fn select_strategy(
    config: &CommitLockConfig,
    capabilities: BackendCapabilities,
) -> Arc<dyn LockStrategy> {
    if capabilities.supports_atomic_lock_and_detect && !config.force_interleavable {
        Arc::new(AtomicStrategy)
    } else {
        Arc::new(InterleavedStrategy)
    }
}
