//! The backend and its sessions.
//!
//! A [`MemoryBackend`] owns one row store and one lock table. Each
//! [`Session`] is one client connection: it locks rows in statements,
//! commits or rolls back, and releases everything when dropped.
//!
//! Lock scope:
//! - Exclusive locks are held until commit or rollback.
//! - Shared locks only last for the statement that took them; they exist
//!   to read a committed version that nobody is about to change.
//!
//! A failed lock statement is undone on its own and the session's
//! transaction continues, except after a deadlock: the victim's
//! transaction has been rolled back by the lock table, and the session
//! refuses further statements until the client calls `rollback`.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use commitlock_common::config::BackendConfig;
use commitlock_common::error::ConfigError;
use commitlock_common::types::{Oid, SessionId, Tid};
use commitlock_common::{BackendError, BackendResult, LockPhase, NativeErrorKind};
use commitlock_txn::{
    find_conflicts, BackendCapabilities, Canceller, ConflictKind, Connection, ConnectionSource,
    CurrentRow, LockWait, VersionConflict, VersionMap,
};
use tracing::{debug, info};

use crate::lock::{LockMode, LockTableConfig, RowLockTable};
use crate::store::{RowStore, StoredRow};

struct BackendInner {
    config: BackendConfig,
    locks: RowLockTable,
    store: RowStore,
    next_session: AtomicU64,
}

/// An in-memory backend with native row locking.
///
/// Clones share the same rows and lock table.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl MemoryBackend {
    /// Creates a backend after validating `config`.
    pub fn new(config: BackendConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: BackendConfig) -> Self {
        info!(
            nowait = config.supports_row_lock_nowait,
            atomic = config.supports_atomic_lock_and_detect,
            deadlock_detection = config.deadlock_detection,
            victim_policy = ?config.victim_policy,
            "memory backend created"
        );
        Self {
            inner: Arc::new(BackendInner {
                locks: RowLockTable::new(LockTableConfig::from(&config)),
                store: RowStore::new(),
                next_session: AtomicU64::new(1),
                config,
            }),
        }
    }

    /// Opens a new session.
    pub fn connect(&self) -> Session {
        let id = SessionId::new(self.inner.next_session.fetch_add(1, AtomicOrdering::Relaxed));
        self.inner.locks.register(id);
        debug!(session = %id, "session opened");
        Session {
            id,
            backend: Arc::clone(&self.inner),
            aborted: None,
            in_transaction: false,
        }
    }

    /// Returns what this backend supports.
    pub fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_row_lock_nowait: self.inner.config.supports_row_lock_nowait,
            supports_atomic_lock_and_detect: self.inner.config.supports_atomic_lock_and_detect,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    /// Returns the shared lock table.
    pub fn lock_table(&self) -> &RowLockTable {
        &self.inner.locks
    }

    /// Returns the committed row for `oid`.
    pub fn read(&self, oid: Oid) -> Option<StoredRow> {
        self.inner.store.get(oid)
    }

    /// Returns the committed version of `oid`.
    pub fn current_tid(&self, oid: Oid) -> Option<Tid> {
        self.inner.store.current_tid(oid)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::build(BackendConfig::default())
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("config", &self.inner.config)
            .field("rows", &self.inner.store.len())
            .field("locks", &self.inner.locks.lock_count())
            .finish()
    }
}

impl ConnectionSource for MemoryBackend {
    fn capabilities(&self) -> BackendCapabilities {
        MemoryBackend::capabilities(self)
    }

    fn open(&self) -> BackendResult<Box<dyn Connection>> {
        Ok(Box::new(self.connect()))
    }
}

/// Cancels one session's lock waits from another thread.
struct SessionCanceller {
    id: SessionId,
    backend: Arc<BackendInner>,
}

impl Canceller for SessionCanceller {
    fn cancel(&self) {
        self.backend.locks.cancel(self.id);
    }
}

/// One client session.
pub struct Session {
    id: SessionId,
    backend: Arc<BackendInner>,
    /// Set when the lock table rolled this session back as a deadlock victim.
    aborted: Option<String>,
    in_transaction: bool,
}

impl Session {
    /// Returns the session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns true if the session must roll back before its next statement.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    fn start_statement(&mut self) -> BackendResult<()> {
        if let Some(reason) = &self.aborted {
            return Err(BackendError::new(
                NativeErrorKind::TransactionAborted,
                format!(
                    "{} is aborted ({}); commands ignored until rollback",
                    self.id, reason
                ),
            ));
        }
        if !self.in_transaction {
            self.in_transaction = true;
            self.backend.locks.begin(self.id);
        }
        Ok(())
    }

    fn check_wait(&self, wait: LockWait) -> BackendResult<()> {
        if wait.is_nowait() && !self.backend.config.supports_row_lock_nowait {
            return Err(BackendError::not_supported("NOWAIT on shared row locks"));
        }
        Ok(())
    }

    fn lock(&mut self, oids: &[Oid], mode: LockMode, wait: LockWait) -> BackendResult<Vec<Oid>> {
        self.backend
            .locks
            .lock_all(self.id, oids, mode, wait)
            .map_err(|e| {
                if e.is_deadlock() {
                    self.aborted = Some(e.message.clone());
                    self.in_transaction = false;
                }
                e
            })
    }

    fn end_transaction(&mut self) -> usize {
        self.aborted = None;
        self.in_transaction = false;
        self.backend.locks.release_all(self.id)
    }
}

impl Connection for Session {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_row_lock_nowait: self.backend.config.supports_row_lock_nowait,
            supports_atomic_lock_and_detect: self.backend.config.supports_atomic_lock_and_detect,
        }
    }

    fn lock_rows_exclusive(
        &mut self,
        oids: &[Oid],
        timeout: Duration,
    ) -> BackendResult<Vec<CurrentRow>> {
        self.start_statement()?;
        self.lock(oids, LockMode::Exclusive, LockWait::Timeout(timeout))?;
        Ok(self.backend.store.current_tids(oids))
    }

    fn lock_rows_shared(&mut self, oids: &[Oid], wait: LockWait) -> BackendResult<Vec<CurrentRow>> {
        self.check_wait(wait)?;
        self.start_statement()?;
        let acquired = self.lock(oids, LockMode::Shared, wait)?;
        let rows = self.backend.store.current_tids(oids);
        self.backend.locks.unlock(self.id, &acquired);
        Ok(rows)
    }

    fn lock_and_detect_conflicts(
        &mut self,
        modify: &[(Oid, Tid)],
        read_current: &[(Oid, Tid)],
        timeout: Duration,
        shared_wait: LockWait,
    ) -> BackendResult<Vec<VersionConflict>> {
        if !self.backend.config.supports_atomic_lock_and_detect {
            return Err(BackendError::not_supported("lock_and_detect_conflicts"));
        }
        self.check_wait(shared_wait)?;

        let modify: VersionMap = modify.iter().copied().collect();
        let modify_oids: Vec<Oid> = modify.keys().copied().collect();
        let mut current: VersionMap = self
            .lock_rows_exclusive(&modify_oids, timeout)
            .map_err(|e| e.in_phase(LockPhase::Modify))?
            .into_iter()
            .map(|(oid, tid)| (oid, Tid::from(tid)))
            .collect();
        let mut conflicts = find_conflicts(&modify, &current, ConflictKind::Write);

        let locked: HashSet<Oid> = modify.keys().copied().collect();
        let (covered, shared): (VersionMap, VersionMap) = read_current
            .iter()
            .copied()
            .partition(|(oid, _)| locked.contains(oid));

        if !shared.is_empty() {
            let oids: Vec<Oid> = shared.keys().copied().collect();
            let rows = self
                .lock_rows_shared(&oids, shared_wait)
                .map_err(|e| e.in_phase(LockPhase::ReadCurrent))?;
            current.extend(rows.into_iter().map(|(oid, tid)| (oid, Tid::from(tid))));
        }

        conflicts.extend(find_conflicts(&covered, &current, ConflictKind::ReadCurrent));
        conflicts.extend(find_conflicts(&shared, &current, ConflictKind::ReadCurrent));
        Ok(conflicts)
    }

    fn commit(&mut self, writes: &[(Oid, Bytes)]) -> BackendResult<Tid> {
        self.start_statement()?;
        if let Some((oid, _)) = writes
            .iter()
            .find(|(oid, _)| !self.backend.locks.holds(self.id, *oid, LockMode::Exclusive))
        {
            return Err(BackendError::new(
                NativeErrorKind::NotLocked,
                format!("row {} is not exclusively locked by {}", oid, self.id),
            ));
        }

        let tid = self.backend.store.apply(writes);
        let released = self.end_transaction();
        debug!(session = %self.id, %tid, rows = writes.len(), released, "committed");
        Ok(tid)
    }

    fn rollback(&mut self) -> BackendResult<()> {
        let released = self.end_transaction();
        debug!(session = %self.id, released, "rolled back");
        Ok(())
    }

    fn canceller(&self) -> Option<Arc<dyn Canceller>> {
        Some(Arc::new(SessionCanceller {
            id: self.id,
            backend: Arc::clone(&self.backend),
        }))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.backend.locks.unregister(self.id);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("aborted", &self.aborted.is_some())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}
