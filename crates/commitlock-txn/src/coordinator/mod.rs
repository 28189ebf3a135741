//! Commit coordination for one storage instance.
//!
//! The coordinator drives each transaction through its lifecycle and
//! invokes the lock strategy exactly once, at vote time.
//!
//! # Transaction States
//!
//! ```text
//! ┌───────┐  store() / check_current_version()  ┌─────────┐
//! │ Begun │────────────────────────────────────▶│ Writing │
//! └───────┘                                     └─────────┘
//!     │                   vote()                     │
//!     └──────────────────────┬───────────────────────┘
//!                            ▼
//!                       ┌────────┐  lock failure or  ┌─────────┐
//!                       │ Voting │──────────────────▶│ Aborted │
//!                       └────────┘  version conflict └─────────┘
//!                            │                            ▲
//!                            ▼                            │ abort()
//!                       ┌───────┐   finish()   ┌──────────┴┐
//!                       │ Voted │─────────────▶│ Finished  │
//!                       └───────┘              └───────────┘
//! ```
//!
//! A failed vote leaves the connection (and any locks it holds) in place
//! until the caller calls [`CommitCoordinator::abort`]. The coordinator
//! never retries; see [`crate::retry`] for a caller-side helper.
//!
//! An ended transaction keeps only its id, state and commit version; its
//! stores and assertions are dropped. [`CommitCoordinator::forget`] and
//! [`CommitCoordinator::purge_ended`] drop the record itself.
//!
//! `abort` does not wait for a vote blocked in the backend: it cancels the
//! connection's lock wait first, then rolls back.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use commitlock_common::config::CommitLockConfig;
use commitlock_common::error::ConfigError;
use commitlock_common::types::{Oid, Tid, TxnId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::connection::{BackendCapabilities, Canceller, Connection, ConnectionSource};
use crate::error::{CommitLockError, LockFailure, TxnResult};
use crate::locker::{Locker, VersionMap};
use crate::strategy::{select_strategy, InterleavedStrategy, LockStrategy, StrategyKind, VoteRequest};

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Started; nothing recorded yet.
    Begun,
    /// Stores or read-current assertions have been recorded.
    Writing,
    /// Locks are being taken and validated.
    Voting,
    /// Every lock is held and every assertion holds.
    Voted,
    /// Committed.
    Finished,
    /// Rolled back, or waiting for the caller to roll back after a failed vote.
    Aborted,
}

impl TransactionState {
    /// Returns true if stores and assertions are still accepted.
    pub fn is_open(&self) -> bool {
        matches!(self, TransactionState::Begun | TransactionState::Writing)
    }

    /// Returns true if the transaction has ended.
    pub fn is_ended(&self) -> bool {
        matches!(self, TransactionState::Finished | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Begun => write!(f, "Begun"),
            TransactionState::Writing => write!(f, "Writing"),
            TransactionState::Voting => write!(f, "Voting"),
            TransactionState::Voted => write!(f, "Voted"),
            TransactionState::Finished => write!(f, "Finished"),
            TransactionState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// A store waiting for commit.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// The version the new data is based on.
    pub expected: Tid,
    /// The new data.
    pub payload: Bytes,
}

/// Per-transaction state. Owns the transaction's backend connection.
pub struct Transaction {
    id: TxnId,
    state: TransactionState,
    writes: BTreeMap<Oid, PendingWrite>,
    read_current: VersionMap,
    /// Assertions left for the shared-lock step of a two-step vote.
    pending_validation: Option<VersionMap>,
    connection: Option<Box<dyn Connection>>,
    commit_tid: Option<Tid>,
    started_at: Instant,
}

impl Transaction {
    fn new(id: TxnId, connection: Box<dyn Connection>) -> Self {
        Self {
            id,
            state: TransactionState::Begun,
            writes: BTreeMap::new(),
            read_current: VersionMap::new(),
            pending_validation: None,
            connection: Some(connection),
            commit_tid: None,
            started_at: Instant::now(),
        }
    }

    /// Returns the transaction ID.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns the commit version, once finished.
    pub fn commit_tid(&self) -> Option<Tid> {
        self.commit_tid
    }

    /// Returns how long the transaction has been running.
    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn expect_state(
        &self,
        accepted: &[TransactionState],
        expected: &'static str,
    ) -> TxnResult<()> {
        if accepted.contains(&self.state) {
            Ok(())
        } else {
            Err(CommitLockError::InvalidState {
                txn_id: self.id,
                current: self.state,
                expected,
            })
        }
    }

    fn expect_open(&self) -> TxnResult<()> {
        self.expect_state(
            &[TransactionState::Begun, TransactionState::Writing],
            "Begun or Writing",
        )
    }

    /// Drops the stores and assertions of an ended transaction.
    fn discard_sets(&mut self) {
        self.writes.clear();
        self.read_current.clear();
        self.pending_validation = None;
    }

    fn write_versions(&self) -> VersionMap {
        self.writes
            .iter()
            .map(|(&oid, write)| (oid, write.expected))
            .collect()
    }

    fn connection_mut(&mut self) -> TxnResult<&mut (dyn Connection + 'static)> {
        let txn_id = self.id;
        match self.connection.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(CommitLockError::InvalidState {
                txn_id,
                current: self.state,
                expected: "an open connection",
            }),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("writes", &self.writes.len())
            .field("read_current", &self.read_current.len())
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

/// A registered transaction and the handle that interrupts its backend waits.
struct TxnSlot {
    txn: Mutex<Transaction>,
    canceller: Option<Arc<dyn Canceller>>,
}

impl TxnSlot {
    fn lock(&self) -> MutexGuard<'_, Transaction> {
        self.txn.lock()
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, Transaction>> {
        self.txn.try_lock()
    }
}

/// Statistics about the coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Total transactions started.
    pub started: AtomicU64,
    /// Total successful votes.
    pub voted: AtomicU64,
    /// Total transactions committed.
    pub finished: AtomicU64,
    /// Total transactions aborted.
    pub aborted: AtomicU64,
    /// Votes that failed to lock rows to modify.
    pub modify_lock_failures: AtomicU64,
    /// Votes that failed to lock rows to read current.
    pub read_current_lock_failures: AtomicU64,
    /// Votes that found a stale read-current assertion.
    pub read_conflicts: AtomicU64,
    /// Votes that found a changed stored object.
    pub write_conflicts: AtomicU64,
    /// Votes that lost a deadlock.
    pub deadlocks: AtomicU64,
}

impl CoordinatorStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_failure(&self, error: &CommitLockError) {
        let counter = match error {
            CommitLockError::UnableToLockRowsToModify { .. } => &self.modify_lock_failures,
            CommitLockError::UnableToLockRowsToReadCurrent { .. } => {
                &self.read_current_lock_failures
            }
            CommitLockError::ReadConflict { .. } => &self.read_conflicts,
            CommitLockError::WriteConflict { .. } => &self.write_conflicts,
            _ => return,
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
        if matches!(error.lock_failure(), Some(LockFailure::Deadlock { .. })) {
            self.deadlocks.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }
}

/// Coordinates transaction lifecycles against one backend.
pub struct CommitCoordinator {
    /// Opens one connection per transaction.
    source: Arc<dyn ConnectionSource>,
    /// Configuration.
    config: CommitLockConfig,
    /// Backend capabilities, queried once.
    capabilities: BackendCapabilities,
    /// How votes reach the backend.
    strategy: Arc<dyn LockStrategy>,
    /// Locking protocol parameters.
    locker: Locker,
    /// Known transactions.
    transactions: RwLock<HashMap<TxnId, Arc<TxnSlot>>>,
    /// Statistics.
    stats: CoordinatorStats,
    /// Next transaction ID, shared with sibling instances.
    next_txn_id: Arc<AtomicU64>,
}

impl CommitCoordinator {
    /// Creates a coordinator over `source`.
    ///
    /// The strategy is selected from the backend's capabilities and the
    /// configuration.
    pub fn new(
        source: Arc<dyn ConnectionSource>,
        config: CommitLockConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let capabilities = source.capabilities();
        let strategy = select_strategy(&config, capabilities);
        let locker = Locker::new(&config, capabilities);

        debug!(
            strategy = %strategy.kind(),
            timeout_ms = locker.commit_lock_timeout().as_millis() as u64,
            nowait = locker.use_nowait(),
            "commit coordinator created"
        );

        Ok(Self {
            source,
            config,
            capabilities,
            strategy,
            locker,
            transactions: RwLock::new(HashMap::new()),
            stats: CoordinatorStats::new(),
            next_txn_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Replaces the selected strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn LockStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Creates a sibling coordinator over the same backend.
    ///
    /// The sibling starts with a copy of this configuration but changes to
    /// either are independent. Transaction ids stay unique across siblings.
    pub fn new_instance(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            capabilities: self.capabilities,
            strategy: Arc::clone(&self.strategy),
            locker: self.locker.clone(),
            transactions: RwLock::new(HashMap::new()),
            stats: CoordinatorStats::new(),
            next_txn_id: Arc::clone(&self.next_txn_id),
        }
    }

    /// Changes the commit lock timeout.
    pub fn set_commit_lock_timeout(&mut self, timeout: Duration) {
        self.config.commit_lock_timeout_secs = timeout.as_secs_f64();
        self.locker
            .set_commit_lock_timeout(self.config.commit_lock_timeout());
    }

    /// Forces (or stops forcing) the interleavable strategy.
    pub fn set_force_interleavable(&mut self, enabled: bool) {
        self.config.force_interleavable = enabled;
        self.strategy = select_strategy(&self.config, self.capabilities);
    }

    /// Forces (or stops forcing) blocking read-current locks.
    pub fn set_force_shared_lock_blocking(&mut self, enabled: bool) {
        self.config.force_shared_lock_blocking = enabled;
        self.locker.set_force_shared_lock_blocking(enabled);
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CommitLockConfig {
        &self.config
    }

    /// Returns the backend capabilities.
    pub fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    /// Returns which strategy votes use.
    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Returns the locker.
    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// Returns the statistics.
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Begins a new transaction on a fresh connection.
    pub fn begin(&self) -> TxnResult<TxnId> {
        let txn_id = TxnId::new(self.next_txn_id.fetch_add(1, AtomicOrdering::SeqCst));
        let connection = self
            .source
            .open()
            .map_err(|source| CommitLockError::Backend { txn_id, source })?;

        debug!(txn_id = %txn_id, session = %connection.session_id(), "transaction begun");

        let slot = TxnSlot {
            canceller: connection.canceller(),
            txn: Mutex::new(Transaction::new(txn_id, connection)),
        };
        self.transactions.write().insert(txn_id, Arc::new(slot));
        self.stats.started.fetch_add(1, AtomicOrdering::Relaxed);

        Ok(txn_id)
    }

    /// Records a store of `payload` to `oid`, based on version `expected`.
    ///
    /// Storing the same object twice keeps the first base version.
    pub fn store(&self, txn_id: TxnId, oid: Oid, expected: Tid, payload: Bytes) -> TxnResult<()> {
        let handle = self.get(txn_id)?;
        let mut txn = handle.lock();
        txn.expect_open()?;

        match txn.writes.get_mut(&oid) {
            Some(write) => write.payload = payload,
            None => {
                txn.writes.insert(oid, PendingWrite { expected, payload });
            }
        }
        txn.state = TransactionState::Writing;
        Ok(())
    }

    /// Asserts that `oid` is still at version `expected` at commit time.
    pub fn check_current_version(&self, txn_id: TxnId, oid: Oid, expected: Tid) -> TxnResult<()> {
        let handle = self.get(txn_id)?;
        let mut txn = handle.lock();
        txn.expect_open()?;

        txn.read_current.entry(oid).or_insert(expected);
        txn.state = TransactionState::Writing;
        Ok(())
    }

    /// Locks and validates the transaction. A transaction votes at most once.
    ///
    /// On failure the transaction is `Aborted`; its locks stay held until
    /// [`CommitCoordinator::abort`].
    pub fn vote(&self, txn_id: TxnId) -> TxnResult<()> {
        let handle = self.get(txn_id)?;
        let mut txn = handle.lock();
        txn.expect_open()?;
        txn.state = TransactionState::Voting;

        let writes = txn.write_versions();
        let read_current = txn.read_current.clone();
        let request = VoteRequest {
            txn_id,
            writes: &writes,
            read_current: &read_current,
        };

        let result = txn
            .connection_mut()
            .and_then(|conn| self.strategy.lock_and_validate(&self.locker, conn, &request));
        self.settle(&mut txn, result, TransactionState::Voted)
    }

    /// First half of a two-step vote: exclusive locks on the write set.
    ///
    /// Moves the transaction to `Voting`; complete the vote with
    /// [`CommitCoordinator::validate_read_current`].
    pub fn lock_for_write(&self, txn_id: TxnId) -> TxnResult<()> {
        let handle = self.get(txn_id)?;
        let mut txn = handle.lock();
        txn.expect_open()?;
        txn.state = TransactionState::Voting;

        let writes = txn.write_versions();
        let read_current = txn.read_current.clone();
        let request = VoteRequest {
            txn_id,
            writes: &writes,
            read_current: &read_current,
        };

        let result = txn.connection_mut().and_then(|conn| {
            InterleavedStrategy.lock_rows_being_modified(&self.locker, conn, &request)
        });
        match result {
            Ok(remaining) => {
                txn.pending_validation = Some(remaining);
                Ok(())
            }
            Err(e) => self.settle(&mut txn, Err(e), TransactionState::Voting),
        }
    }

    /// Second half of a two-step vote: read-current validation.
    ///
    /// `use_nowait` overrides the configured wait mode; NOWAIT is still only
    /// used where the backend supports it.
    pub fn validate_read_current(&self, txn_id: TxnId, use_nowait: Option<bool>) -> TxnResult<()> {
        let handle = self.get(txn_id)?;
        let mut txn = handle.lock();
        txn.expect_state(&[TransactionState::Voting], "Voting")?;

        let Some(remaining) = txn.pending_validation.take() else {
            return Err(CommitLockError::InvalidState {
                txn_id,
                current: txn.state,
                expected: "Voting after lock_for_write",
            });
        };

        let use_nowait = use_nowait.unwrap_or_else(|| self.locker.use_nowait());
        let result = txn.connection_mut().and_then(|conn| {
            self.locker
                .validate_read_current(conn, txn_id, &remaining, use_nowait)
        });
        self.settle(&mut txn, result, TransactionState::Voted)
    }

    /// Commits a voted transaction and returns its commit version.
    pub fn finish(&self, txn_id: TxnId) -> TxnResult<Tid> {
        let handle = self.get(txn_id)?;
        let mut txn = handle.lock();
        txn.expect_state(&[TransactionState::Voted], "Voted")?;

        let writes: Vec<(Oid, Bytes)> = txn
            .writes
            .iter()
            .map(|(&oid, write)| (oid, write.payload.clone()))
            .collect();

        let result = txn
            .connection_mut()?
            .commit(&writes)
            .map_err(|source| CommitLockError::Backend { txn_id, source });

        match result {
            Ok(tid) => {
                txn.connection = None;
                txn.discard_sets();
                txn.commit_tid = Some(tid);
                txn.state = TransactionState::Finished;
                self.stats.finished.fetch_add(1, AtomicOrdering::Relaxed);
                info!(txn_id = %txn_id, %tid, rows = writes.len(), "transaction finished");
                Ok(tid)
            }
            Err(e) => {
                warn!(txn_id = %txn_id, error = %e, "commit failed");
                self.release(&mut txn);
                Err(e)
            }
        }
    }

    /// Rolls back the transaction and releases its locks.
    ///
    /// Safe to call in any state, repeatedly, and for unknown ids.
    /// Finished transactions are left alone. If another thread is voting,
    /// its lock wait is cancelled so the vote fails instead of running out
    /// the commit lock timeout.
    pub fn abort(&self, txn_id: TxnId) {
        let Some(slot) = self.transactions.read().get(&txn_id).cloned() else {
            debug!(txn_id = %txn_id, "abort of unknown transaction ignored");
            return;
        };
        let mut txn = match slot.try_lock() {
            Some(txn) => txn,
            None => {
                if let Some(canceller) = &slot.canceller {
                    debug!(txn_id = %txn_id, "cancelling busy transaction");
                    canceller.cancel();
                }
                slot.lock()
            }
        };
        if txn.state == TransactionState::Finished {
            debug!(txn_id = %txn_id, "abort of finished transaction ignored");
            return;
        }
        self.release(&mut txn);
    }

    /// Returns the state of a transaction, if known.
    pub fn state(&self, txn_id: TxnId) -> Option<TransactionState> {
        let handle = self.transactions.read().get(&txn_id).cloned()?;
        let state = handle.lock().state;
        Some(state)
    }

    /// Returns the number of transactions that have not ended.
    pub fn active_count(&self) -> usize {
        let handles: Vec<_> = self.transactions.read().values().cloned().collect();
        handles
            .iter()
            .filter(|handle| !handle.lock().state.is_ended())
            .count()
    }

    /// Drops the record of `txn_id` if it has ended and returns true if so.
    ///
    /// Its state is no longer reported afterwards. Live or busy
    /// transactions are kept.
    pub fn forget(&self, txn_id: TxnId) -> bool {
        let mut txns = self.transactions.write();
        let ended = txns
            .get(&txn_id)
            .and_then(|slot| slot.try_lock().map(|txn| Self::is_settled(&txn)))
            .unwrap_or(false);
        if ended {
            txns.remove(&txn_id);
        }
        ended
    }

    /// Drops the records of ended transactions and returns how many went.
    ///
    /// Transactions busy in another thread are kept.
    pub fn purge_ended(&self) -> usize {
        let mut txns = self.transactions.write();
        let before = txns.len();
        txns.retain(|_, slot| slot.try_lock().map_or(true, |txn| !Self::is_settled(&txn)));
        before - txns.len()
    }

    /// Ended, with no connection left to roll back.
    fn is_settled(txn: &Transaction) -> bool {
        txn.state.is_ended() && txn.connection.is_none()
    }

    fn get(&self, txn_id: TxnId) -> TxnResult<Arc<TxnSlot>> {
        self.transactions
            .read()
            .get(&txn_id)
            .cloned()
            .ok_or(CommitLockError::TransactionNotFound { txn_id })
    }

    /// Applies the outcome of a locking step.
    fn settle(
        &self,
        txn: &mut Transaction,
        result: TxnResult<()>,
        on_success: TransactionState,
    ) -> TxnResult<()> {
        match result {
            Ok(()) => {
                txn.state = on_success;
                if on_success == TransactionState::Voted {
                    self.stats.voted.fetch_add(1, AtomicOrdering::Relaxed);
                    debug!(
                        txn_id = %txn.id,
                        writes = txn.writes.len(),
                        read_current = txn.read_current.len(),
                        "transaction voted"
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.stats.record_failure(&e);
                info!(
                    txn_id = %txn.id,
                    code = ?e.code(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "vote failed"
                );
                self.mark_aborted(txn);
                Err(e)
            }
        }
    }

    /// Rolls back the connection, if still open, and marks the transaction aborted.
    fn release(&self, txn: &mut Transaction) {
        if let Some(mut conn) = txn.connection.take() {
            if let Err(e) = conn.rollback() {
                warn!(txn_id = %txn.id, session = %conn.session_id(), error = %e, "rollback failed");
            }
        }
        self.mark_aborted(txn);
    }

    fn mark_aborted(&self, txn: &mut Transaction) {
        txn.discard_sets();
        if txn.state != TransactionState::Aborted {
            txn.state = TransactionState::Aborted;
            self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(txn_id = %txn.id, elapsed_ms = txn.duration().as_millis() as u64, "transaction aborted");
        }
    }
}

impl fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitCoordinator")
            .field("config", &self.config)
            .field("capabilities", &self.capabilities)
            .field("strategy", &self.strategy.kind())
            .field("transactions", &self.transactions.read().len())
            .finish()
    }
}
