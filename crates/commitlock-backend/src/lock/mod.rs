//! Row lock table with shared (S) and exclusive (X) modes.
//!
//! # Lock Compatibility Matrix
//!
//! ```text
//!          │ S  │ X  │
//! ─────────┼────┼────┤
//!     S    │ ✓  │ ✗  │
//!     X    │ ✗  │ ✗  │
//! ```
//!
//! A session holding X on a row already covers S; a sole S holder may
//! upgrade to X.
//!
//! # Waiting
//!
//! A blocked request sleeps on the table's condition variable until a lock
//! is released, the statement's deadline passes, its session is chosen as
//! a deadlock victim, or another thread cancels the session. With
//! detection enabled, the wait-for graph is checked whenever a request
//! blocks and again every check interval.
//! Waiters are not queued: whoever re-checks first after a release wins.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use commitlock_common::config::{BackendConfig, VictimPolicy};
use commitlock_common::types::{Oid, SessionId};
use commitlock_common::{BackendError, BackendResult, NativeErrorKind};
use commitlock_txn::LockWait;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::deadlock::{format_cycle, WaitForGraph};

/// Lock mode for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock (read lock).
    Shared,
    /// Exclusive lock (write lock).
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Returns true if holding `self` satisfies a request for `other`.
    pub fn covers(&self, other: &LockMode) -> bool {
        *self == LockMode::Exclusive || self == other
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// Result of a successful lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Lock was granted.
    Granted,
    /// Lock was upgraded from S to X.
    Upgraded,
    /// Session already holds the lock in a covering mode.
    AlreadyHeld,
}

/// The lock state of one row.
#[derive(Debug)]
pub struct RowLock {
    /// The row.
    pub oid: Oid,
    /// Current lock mode.
    pub mode: LockMode,
    /// Sessions holding the lock.
    pub holders: HashSet<SessionId>,
}

impl RowLock {
    /// Creates an unheld row lock.
    pub fn new(oid: Oid) -> Self {
        Self {
            oid,
            mode: LockMode::Shared,
            holders: HashSet::new(),
        }
    }

    /// Returns the sessions that prevent `session` from taking `mode`.
    ///
    /// Empty means the request can be granted now.
    pub fn blockers(&self, session: SessionId, mode: LockMode) -> Vec<SessionId> {
        if self.holders.is_empty() {
            return Vec::new();
        }
        if self.holders.contains(&session) {
            if self.mode.covers(&mode) || self.holders.len() == 1 {
                return Vec::new();
            }
        } else if mode.is_compatible_with(&self.mode) {
            return Vec::new();
        }
        self.holders
            .iter()
            .copied()
            .filter(|holder| *holder != session)
            .collect()
    }

    /// Grants `mode` to `session`, or returns who is in the way.
    pub fn try_grant(
        &mut self,
        session: SessionId,
        mode: LockMode,
    ) -> Result<LockResult, Vec<SessionId>> {
        let blockers = self.blockers(session, mode);
        if !blockers.is_empty() {
            return Err(blockers);
        }

        if self.holders.is_empty() {
            self.mode = mode;
            self.holders.insert(session);
            Ok(LockResult::Granted)
        } else if self.holders.contains(&session) {
            if self.mode.covers(&mode) {
                Ok(LockResult::AlreadyHeld)
            } else {
                self.mode = LockMode::Exclusive;
                Ok(LockResult::Upgraded)
            }
        } else {
            self.holders.insert(session);
            Ok(LockResult::Granted)
        }
    }

    /// Releases a lock held by a session.
    pub fn release(&mut self, session: SessionId) -> bool {
        self.holders.remove(&session)
    }

    /// Returns true if the lock is free.
    pub fn is_free(&self) -> bool {
        self.holders.is_empty()
    }
}

/// Statistics about the lock table.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Total lock acquisitions.
    pub acquisitions: AtomicU64,
    /// Total lock releases.
    pub releases: AtomicU64,
    /// Total lock upgrades.
    pub upgrades: AtomicU64,
    /// Total requests that had to wait.
    pub waits: AtomicU64,
    /// Total lock wait timeouts.
    pub timeouts: AtomicU64,
    /// Total NOWAIT requests refused.
    pub nowait_rejections: AtomicU64,
    /// Total deadlocks detected.
    pub deadlocks: AtomicU64,
}

impl LockStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record(&self, result: LockResult) {
        match result {
            LockResult::Granted => Self::bump(&self.acquisitions),
            LockResult::Upgraded => Self::bump(&self.upgrades),
            LockResult::AlreadyHeld => {}
        }
    }
}

/// Configuration for the lock table.
#[derive(Debug, Clone, Copy)]
pub struct LockTableConfig {
    /// Whether to run deadlock detection.
    pub deadlock_detection: bool,
    /// How often blocked requests re-check for deadlocks.
    pub deadlock_check_interval: Duration,
    /// Which cycle member is rolled back.
    pub victim_policy: VictimPolicy,
}

impl From<&BackendConfig> for LockTableConfig {
    fn from(config: &BackendConfig) -> Self {
        Self {
            deadlock_detection: config.deadlock_detection,
            deadlock_check_interval: config.deadlock_check_interval(),
            victim_policy: config.victim_policy,
        }
    }
}

impl Default for LockTableConfig {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

#[derive(Debug, Default)]
struct LockTableState {
    locks: HashMap<Oid, RowLock>,
    held: HashMap<SessionId, HashSet<Oid>>,
    wfg: WaitForGraph,
    /// Deadlock victims rolled back while blocked, with the reason to report.
    doomed: HashMap<SessionId, String>,
    /// Sessions whose next lock request fails at once, until they release.
    cancelled: HashSet<SessionId>,
}

impl LockTableState {
    fn try_grant(
        &mut self,
        session: SessionId,
        oid: Oid,
        mode: LockMode,
    ) -> Result<LockResult, Vec<SessionId>> {
        let result = self
            .locks
            .entry(oid)
            .or_insert_with(|| RowLock::new(oid))
            .try_grant(session, mode)?;

        let held = self.held.entry(session).or_default();
        held.insert(oid);
        let count = held.len();
        self.wfg.update_locks_held(session, count);
        Ok(result)
    }

    fn release(&mut self, session: SessionId, oid: Oid) -> bool {
        let Some(lock) = self.locks.get_mut(&oid) else {
            return false;
        };
        let released = lock.release(session);
        if lock.is_free() {
            self.locks.remove(&oid);
        }
        if let Some(held) = self.held.get_mut(&session) {
            held.remove(&oid);
            let count = held.len();
            self.wfg.update_locks_held(session, count);
        }
        released
    }

    fn release_all(&mut self, session: SessionId) -> usize {
        let oids = self.held.remove(&session).unwrap_or_default();
        let mut count = 0;
        for oid in oids {
            if let Some(lock) = self.locks.get_mut(&oid) {
                if lock.release(session) {
                    count += 1;
                }
                if lock.is_free() {
                    self.locks.remove(&oid);
                }
            }
        }
        self.wfg.update_locks_held(session, 0);
        self.wfg.clear_waits(session);
        self.cancelled.remove(&session);
        count
    }

    /// Recomputes every blocked session's edges from the current holders.
    fn refresh_waits(&mut self) {
        let Self { locks, wfg, .. } = self;
        for (session, request) in wfg.pending_requests() {
            let blockers = locks
                .get(&request.oid)
                .map(|lock| lock.blockers(session, request.mode))
                .unwrap_or_default();
            wfg.set_edges(session, blockers);
        }
    }
}

/// The row lock table shared by every session of a backend.
pub struct RowLockTable {
    state: Mutex<LockTableState>,
    /// Signalled whenever locks are released.
    released: Condvar,
    config: LockTableConfig,
    stats: LockStats,
}

impl RowLockTable {
    /// Creates a lock table.
    pub fn new(config: LockTableConfig) -> Self {
        Self {
            state: Mutex::new(LockTableState::default()),
            released: Condvar::new(),
            config,
            stats: LockStats::new(),
        }
    }

    /// Registers a session with the deadlock detector.
    pub fn register(&self, session: SessionId) {
        self.state.lock().wfg.add_session(session);
    }

    /// Releases everything a session holds and forgets it.
    pub fn unregister(&self, session: SessionId) {
        let mut state = self.state.lock();
        let released = state.release_all(session);
        state.wfg.remove_session(session);
        state.doomed.remove(&session);
        state.cancelled.remove(&session);
        self.after_release(released);
    }

    /// Interrupts `session` from another thread.
    ///
    /// A request the session is blocked in fails at once, as does its next
    /// one; the flag clears when the session releases its locks. Unknown
    /// sessions are ignored.
    pub fn cancel(&self, session: SessionId) {
        let mut state = self.state.lock();
        if !state.wfg.contains(session) {
            return;
        }
        let waiting = state.wfg.is_waiting(session);
        state.cancelled.insert(session);
        debug!(%session, waiting, "session cancelled");
        self.released.notify_all();
    }

    /// Marks the start of a new transaction on `session`.
    pub fn begin(&self, session: SessionId) {
        self.state.lock().wfg.restart(session);
    }

    /// Locks every row in `oids` in order, within one deadline.
    ///
    /// Returns the rows this call newly locked. On failure those rows are
    /// released again; locks held before the call are kept, except that a
    /// deadlock victim loses all of its locks.
    pub fn lock_all(
        &self,
        session: SessionId,
        oids: &[Oid],
        mode: LockMode,
        wait: LockWait,
    ) -> BackendResult<Vec<Oid>> {
        let deadline = match wait {
            LockWait::NoWait => None,
            LockWait::Timeout(timeout) => Some(Instant::now() + timeout),
        };

        let mut state = self.state.lock();
        let mut acquired = Vec::with_capacity(oids.len());
        for &oid in oids {
            match self.acquire(&mut state, session, oid, mode, deadline) {
                Ok(LockResult::AlreadyHeld) => {}
                Ok(_) => acquired.push(oid),
                Err(e) => {
                    let mut released = 0;
                    for oid in acquired {
                        if state.release(session, oid) {
                            released += 1;
                        }
                    }
                    self.after_release(released);
                    return Err(e);
                }
            }
        }

        trace!(%session, %mode, %wait, rows = oids.len(), new = acquired.len(), "rows locked");
        Ok(acquired)
    }

    fn acquire(
        &self,
        state: &mut MutexGuard<'_, LockTableState>,
        session: SessionId,
        oid: Oid,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> BackendResult<LockResult> {
        let mut waited = false;
        loop {
            if let Some(message) = state.doomed.remove(&session) {
                state.wfg.clear_waits(session);
                return Err(BackendError::new(NativeErrorKind::Deadlock, message));
            }
            if state.cancelled.remove(&session) {
                state.wfg.clear_waits(session);
                return Err(BackendError::new(
                    NativeErrorKind::TransactionAborted,
                    format!("{} lock request on row {} cancelled for {}", mode, oid, session),
                ));
            }

            let blockers = match state.try_grant(session, oid, mode) {
                Ok(result) => {
                    state.wfg.clear_waits(session);
                    self.stats.record(result);
                    return Ok(result);
                }
                Err(blockers) => blockers,
            };

            let Some(deadline) = deadline else {
                LockStats::bump(&self.stats.nowait_rejections);
                return Err(BackendError::new(
                    NativeErrorKind::LockNotAvailable,
                    format!(
                        "could not obtain {} lock on row {} held by {}",
                        mode,
                        oid,
                        format_sessions(&blockers)
                    ),
                ));
            };

            if !waited {
                waited = true;
                LockStats::bump(&self.stats.waits);
                debug!(%session, %oid, %mode, blockers = %format_sessions(&blockers), "waiting for row lock");
            }
            state.wfg.set_waiting(session, oid, mode, blockers.iter().copied());

            if self.config.deadlock_detection {
                if let Some(err) = self.resolve_deadlock(state, session, oid, mode) {
                    return Err(err);
                }
                if !state.wfg.is_waiting(session) {
                    // Another member was rolled back; retry at once.
                    continue;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                state.wfg.clear_waits(session);
                LockStats::bump(&self.stats.timeouts);
                return Err(BackendError::new(
                    NativeErrorKind::LockWaitTimeout,
                    format!(
                        "timed out waiting for {} lock on row {} held by {}",
                        mode,
                        oid,
                        format_sessions(&blockers)
                    ),
                ));
            }

            let wake = if self.config.deadlock_detection {
                deadline.min(now + self.config.deadlock_check_interval)
            } else {
                deadline
            };
            self.released.wait_until(state, wake);
        }
    }

    /// Looks for a cycle through `session` and rolls back the victim.
    ///
    /// Returns the error to raise if `session` is the victim. Otherwise the
    /// victim is rolled back, doomed, and `session`'s waits are cleared so
    /// it re-checks immediately.
    fn resolve_deadlock(
        &self,
        state: &mut MutexGuard<'_, LockTableState>,
        session: SessionId,
        oid: Oid,
        mode: LockMode,
    ) -> Option<BackendError> {
        state.refresh_waits();
        let cycle = state.wfg.detect_deadlock(session)?;
        let victim = state
            .wfg
            .select_victim(&cycle, self.config.victim_policy, session)?;

        let message = format!(
            "{} requested {} lock on row {}; cycle {}; {} chosen as victim",
            session,
            mode,
            oid,
            format_cycle(&cycle),
            victim
        );
        LockStats::bump(&self.stats.deadlocks);
        warn!(%session, %victim, cycle = %format_cycle(&cycle), "deadlock detected");

        let released = state.release_all(victim);
        self.after_release(released);

        if victim == session {
            Some(BackendError::new(NativeErrorKind::Deadlock, message))
        } else {
            state.doomed.insert(victim, message);
            state.wfg.clear_waits(session);
            None
        }
    }

    /// Releases `oids` held by `session`.
    pub fn unlock(&self, session: SessionId, oids: &[Oid]) -> usize {
        let mut state = self.state.lock();
        let released = oids
            .iter()
            .filter(|oid| state.release(session, **oid))
            .count();
        self.after_release(released);
        released
    }

    /// Releases every lock `session` holds.
    pub fn release_all(&self, session: SessionId) -> usize {
        let mut state = self.state.lock();
        state.doomed.remove(&session);
        let released = state.release_all(session);
        self.after_release(released);
        released
    }

    fn after_release(&self, released: usize) {
        if released > 0 {
            self.stats
                .releases
                .fetch_add(released as u64, AtomicOrdering::Relaxed);
            self.released.notify_all();
        }
    }

    /// Returns true if `session` holds `oid` in a mode covering `mode`.
    pub fn holds(&self, session: SessionId, oid: Oid, mode: LockMode) -> bool {
        self.state.lock().locks.get(&oid).map_or(false, |lock| {
            lock.holders.contains(&session) && lock.mode.covers(&mode)
        })
    }

    /// Returns the rows `session` holds locks on.
    pub fn held_by(&self, session: SessionId) -> Vec<Oid> {
        let mut oids: Vec<Oid> = self
            .state
            .lock()
            .held
            .get(&session)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        oids.sort_unstable();
        oids
    }

    /// Returns the number of locked rows.
    pub fn lock_count(&self) -> usize {
        self.state.lock().locks.len()
    }

    /// Returns statistics about the lock table.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LockTableConfig {
        &self.config
    }
}

impl Default for RowLockTable {
    fn default() -> Self {
        Self::new(LockTableConfig::default())
    }
}

impl fmt::Debug for RowLockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowLockTable")
            .field("lock_count", &self.lock_count())
            .field("config", &self.config)
            .finish()
    }
}

fn format_sessions(sessions: &[SessionId]) -> String {
    let mut sessions = sessions.to_vec();
    sessions.sort_unstable();
    sessions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn s(id: u64) -> SessionId {
        SessionId::new(id)
    }

    fn oid(id: u64) -> Oid {
        Oid::new(id)
    }

    fn table() -> RowLockTable {
        RowLockTable::new(LockTableConfig {
            deadlock_detection: true,
            deadlock_check_interval: Duration::from_millis(10),
            victim_policy: VictimPolicy::Requester,
        })
    }

    const WAIT: LockWait = LockWait::Timeout(Duration::from_millis(50));

    #[test]
    fn test_lock_mode_compatibility() {
        assert!(LockMode::Shared.is_compatible_with(&LockMode::Shared));
        assert!(!LockMode::Shared.is_compatible_with(&LockMode::Exclusive));
        assert!(!LockMode::Exclusive.is_compatible_with(&LockMode::Shared));
        assert!(LockMode::Exclusive.covers(&LockMode::Shared));
        assert!(!LockMode::Shared.covers(&LockMode::Exclusive));
    }

    #[test]
    fn test_row_lock_grant_and_upgrade() {
        let mut lock = RowLock::new(oid(1));
        assert_eq!(lock.try_grant(s(1), LockMode::Shared), Ok(LockResult::Granted));
        assert_eq!(lock.try_grant(s(2), LockMode::Shared), Ok(LockResult::Granted));
        assert_eq!(lock.try_grant(s(1), LockMode::Exclusive), Err(vec![s(2)]));

        assert!(lock.release(s(2)));
        assert_eq!(lock.try_grant(s(1), LockMode::Exclusive), Ok(LockResult::Upgraded));
        assert_eq!(lock.try_grant(s(1), LockMode::Shared), Ok(LockResult::AlreadyHeld));
        assert_eq!(lock.try_grant(s(2), LockMode::Shared), Err(vec![s(1)]));
    }

    #[test]
    fn test_shared_locks_coexist() {
        let table = table();
        table.lock_all(s(1), &[oid(1)], LockMode::Shared, WAIT).unwrap();
        table.lock_all(s(2), &[oid(1)], LockMode::Shared, WAIT).unwrap();
        assert!(table.holds(s(1), oid(1), LockMode::Shared));
        assert!(table.holds(s(2), oid(1), LockMode::Shared));
    }

    #[test]
    fn test_nowait_rejection() {
        let table = table();
        table.lock_all(s(1), &[oid(1)], LockMode::Exclusive, WAIT).unwrap();

        let start = Instant::now();
        let err = table
            .lock_all(s(2), &[oid(1)], LockMode::Shared, LockWait::NoWait)
            .unwrap_err();
        assert_eq!(err.kind, NativeErrorKind::LockNotAvailable);
        assert!(err.message.contains("session-1"));
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(table.stats().nowait_rejections.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_timeout_releases_partial_statement() {
        let table = table();
        table.lock_all(s(1), &[oid(2)], LockMode::Exclusive, WAIT).unwrap();

        let start = Instant::now();
        let err = table
            .lock_all(s(2), &[oid(1), oid(2)], LockMode::Exclusive, WAIT)
            .unwrap_err();
        assert_eq!(err.kind, NativeErrorKind::LockWaitTimeout);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!table.holds(s(2), oid(1), LockMode::Exclusive));
        assert_eq!(table.stats().timeouts.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_waiter_granted_on_release() {
        let table = Arc::new(table());
        table.lock_all(s(1), &[oid(1)], LockMode::Exclusive, WAIT).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.lock_all(
                    s(2),
                    &[oid(1)],
                    LockMode::Exclusive,
                    LockWait::Timeout(Duration::from_secs(5)),
                )
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(table.release_all(s(1)), 1);

        assert_eq!(waiter.join().unwrap().unwrap(), vec![oid(1)]);
        assert!(table.holds(s(2), oid(1), LockMode::Exclusive));
    }

    #[test]
    fn test_already_held_not_reported_as_new() {
        let table = table();
        table.lock_all(s(1), &[oid(1)], LockMode::Exclusive, WAIT).unwrap();
        let new = table
            .lock_all(s(1), &[oid(1), oid(2)], LockMode::Shared, WAIT)
            .unwrap();
        assert_eq!(new, vec![oid(2)]);
        assert_eq!(table.unlock(s(1), &new), 1);
        assert!(table.holds(s(1), oid(1), LockMode::Exclusive));
    }

    #[test]
    fn test_deadlock_requester_is_victim() {
        let table = Arc::new(table());
        table.register(s(1));
        table.register(s(2));
        table.lock_all(s(1), &[oid(1)], LockMode::Exclusive, WAIT).unwrap();
        table.lock_all(s(2), &[oid(2)], LockMode::Exclusive, WAIT).unwrap();

        let first = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.lock_all(
                    s(1),
                    &[oid(2)],
                    LockMode::Shared,
                    LockWait::Timeout(Duration::from_secs(5)),
                )
            })
        };
        thread::sleep(Duration::from_millis(30));

        let err = table
            .lock_all(
                s(2),
                &[oid(1)],
                LockMode::Shared,
                LockWait::Timeout(Duration::from_secs(5)),
            )
            .unwrap_err();
        assert!(err.is_deadlock());
        assert!(err.to_string().contains("deadlock"));
        assert!(table.held_by(s(2)).is_empty());

        assert!(first.join().unwrap().is_ok());
        assert_eq!(table.stats().deadlocks.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_deadlock_oldest_waiter_is_victim() {
        let table = Arc::new(RowLockTable::new(LockTableConfig {
            deadlock_detection: true,
            deadlock_check_interval: Duration::from_millis(10),
            victim_policy: VictimPolicy::OldestWaiter,
        }));
        table.register(s(1));
        table.register(s(2));
        table.lock_all(s(1), &[oid(1)], LockMode::Exclusive, WAIT).unwrap();
        table.lock_all(s(2), &[oid(2)], LockMode::Exclusive, WAIT).unwrap();

        let first = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.lock_all(
                    s(1),
                    &[oid(2)],
                    LockMode::Shared,
                    LockWait::Timeout(Duration::from_secs(5)),
                )
            })
        };
        thread::sleep(Duration::from_millis(30));

        table
            .lock_all(
                s(2),
                &[oid(1)],
                LockMode::Shared,
                LockWait::Timeout(Duration::from_secs(5)),
            )
            .unwrap();

        let err = first.join().unwrap().unwrap_err();
        assert!(err.is_deadlock());
        assert!(table.held_by(s(1)).is_empty());
    }

    #[test]
    fn test_cancel_interrupts_blocked_request() {
        let table = Arc::new(table());
        table.register(s(1));
        table.register(s(2));
        table.lock_all(s(1), &[oid(1)], LockMode::Exclusive, WAIT).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let start = Instant::now();
                let result = table.lock_all(
                    s(2),
                    &[oid(2), oid(1)],
                    LockMode::Exclusive,
                    LockWait::Timeout(Duration::from_secs(5)),
                );
                (result, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        table.cancel(s(2));

        let (result, elapsed) = waiter.join().unwrap();
        assert_eq!(result.unwrap_err().kind, NativeErrorKind::TransactionAborted);
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
        assert!(table.held_by(s(2)).is_empty());
        assert!(table.holds(s(1), oid(1), LockMode::Exclusive));

        // Releasing clears the flag.
        table.release_all(s(2));
        table.lock_all(s(2), &[oid(2)], LockMode::Exclusive, WAIT).unwrap();
    }

    #[test]
    fn test_cancel_before_request_and_unknown_session() {
        let table = table();
        table.register(s(1));
        table.cancel(s(1));
        table.cancel(s(9));

        let err = table
            .lock_all(s(1), &[oid(1)], LockMode::Exclusive, WAIT)
            .unwrap_err();
        assert_eq!(err.kind, NativeErrorKind::TransactionAborted);
        table.lock_all(s(1), &[oid(1)], LockMode::Exclusive, WAIT).unwrap();

        table.lock_all(s(9), &[oid(2)], LockMode::Exclusive, WAIT).unwrap();
    }

    #[test]
    fn test_unregister_releases() {
        let table = table();
        table.register(s(1));
        table.lock_all(s(1), &[oid(1), oid(2)], LockMode::Exclusive, WAIT).unwrap();
        assert_eq!(table.lock_count(), 2);
        table.unregister(s(1));
        assert_eq!(table.lock_count(), 0);
    }
}
