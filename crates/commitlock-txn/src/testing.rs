//! A scripted in-process connection for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use commitlock_common::types::{Oid, SessionId, Tid};
use commitlock_common::{BackendError, BackendResult};
use parking_lot::Mutex;

use crate::connection::{
    BackendCapabilities, ConflictKind, Connection, ConnectionSource, CurrentRow, LockWait,
    VersionConflict,
};

/// A recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exclusive(Vec<Oid>, Duration),
    Shared(Vec<Oid>, LockWait),
    Atomic {
        modify: Vec<Oid>,
        read_current: Vec<Oid>,
        shared_wait: LockWait,
    },
    Commit(Vec<Oid>),
    Rollback,
}

#[derive(Debug, Default)]
struct MockState {
    rows: HashMap<Oid, Tid>,
    calls: Vec<Call>,
    fail_exclusive: Option<BackendError>,
    fail_shared: Option<BackendError>,
    fail_atomic: Option<BackendError>,
    fail_commit: Option<BackendError>,
}

/// Connection backed by a map of committed versions. Clones share state.
///
/// Scripted failures fire once, on the next matching call.
#[derive(Debug, Clone)]
pub struct MockConnection {
    session: SessionId,
    capabilities: BackendCapabilities,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            session: SessionId::new(1),
            capabilities: BackendCapabilities::default(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_rows(self, rows: &[(u64, u64)]) -> Self {
        {
            let mut state = self.state.lock();
            for &(oid, tid) in rows {
                state.rows.insert(Oid::new(oid), Tid::new(tid));
            }
        }
        self
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn fail_exclusive(self, error: BackendError) -> Self {
        self.state.lock().fail_exclusive = Some(error);
        self
    }

    pub fn fail_shared(self, error: BackendError) -> Self {
        self.state.lock().fail_shared = Some(error);
        self
    }

    pub fn fail_atomic(self, error: BackendError) -> Self {
        self.state.lock().fail_atomic = Some(error);
        self
    }

    pub fn fail_commit(self, error: BackendError) -> Self {
        self.state.lock().fail_commit = Some(error);
        self
    }

    /// Overwrites a committed version, as a concurrent commit would.
    pub fn set_row(&self, oid: u64, tid: u64) {
        self.state.lock().rows.insert(Oid::new(oid), Tid::new(tid));
    }

    pub fn row(&self, oid: u64) -> Option<Tid> {
        self.state.lock().rows.get(&Oid::new(oid)).copied()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Rollback))
            .count()
    }

    /// Returns a source whose connections all share this mock's state.
    pub fn source(&self) -> MockSource {
        MockSource {
            template: self.clone(),
            next_session: AtomicU64::new(1),
        }
    }

    fn current(state: &MockState, oids: &[Oid]) -> Vec<CurrentRow> {
        oids.iter()
            .map(|oid| (*oid, state.rows.get(oid).copied()))
            .collect()
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MockConnection {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn lock_rows_exclusive(
        &mut self,
        oids: &[Oid],
        timeout: Duration,
    ) -> BackendResult<Vec<CurrentRow>> {
        let mut state = self.state.lock();
        state.calls.push(Call::Exclusive(oids.to_vec(), timeout));
        if let Some(err) = state.fail_exclusive.take() {
            return Err(err);
        }
        Ok(Self::current(&state, oids))
    }

    fn lock_rows_shared(&mut self, oids: &[Oid], wait: LockWait) -> BackendResult<Vec<CurrentRow>> {
        let mut state = self.state.lock();
        state.calls.push(Call::Shared(oids.to_vec(), wait));
        if let Some(err) = state.fail_shared.take() {
            return Err(err);
        }
        Ok(Self::current(&state, oids))
    }

    fn lock_and_detect_conflicts(
        &mut self,
        modify: &[(Oid, Tid)],
        read_current: &[(Oid, Tid)],
        _timeout: Duration,
        shared_wait: LockWait,
    ) -> BackendResult<Vec<VersionConflict>> {
        let mut state = self.state.lock();
        state.calls.push(Call::Atomic {
            modify: modify.iter().map(|(o, _)| *o).collect(),
            read_current: read_current.iter().map(|(o, _)| *o).collect(),
            shared_wait,
        });
        if let Some(err) = state.fail_atomic.take() {
            return Err(err);
        }

        let check = |pairs: &[(Oid, Tid)], kind: ConflictKind| -> Vec<VersionConflict> {
            pairs
                .iter()
                .filter_map(|&(oid, expected)| {
                    let actual = state.rows.get(&oid).copied().unwrap_or(Tid::ZERO);
                    (actual != expected).then_some(VersionConflict {
                        oid,
                        expected,
                        actual,
                        kind,
                    })
                })
                .collect()
        };
        let mut conflicts = check(modify, ConflictKind::Write);
        conflicts.extend(check(read_current, ConflictKind::ReadCurrent));
        Ok(conflicts)
    }

    fn commit(&mut self, writes: &[(Oid, Bytes)]) -> BackendResult<Tid> {
        let mut state = self.state.lock();
        state
            .calls
            .push(Call::Commit(writes.iter().map(|(o, _)| *o).collect()));
        if let Some(err) = state.fail_commit.take() {
            return Err(err);
        }
        let tid = state
            .rows
            .values()
            .copied()
            .max()
            .unwrap_or(Tid::ZERO)
            .next();
        for (oid, _) in writes {
            state.rows.insert(*oid, tid);
        }
        Ok(tid)
    }

    fn rollback(&mut self) -> BackendResult<()> {
        self.state.lock().calls.push(Call::Rollback);
        Ok(())
    }
}

/// Hands out clones of a [`MockConnection`] with fresh session ids.
#[derive(Debug)]
pub struct MockSource {
    template: MockConnection,
    next_session: AtomicU64,
}

impl ConnectionSource for MockSource {
    fn capabilities(&self) -> BackendCapabilities {
        self.template.capabilities
    }

    fn open(&self) -> BackendResult<Box<dyn Connection>> {
        let mut conn = self.template.clone();
        conn.session = SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed));
        Ok(Box::new(conn))
    }
}
