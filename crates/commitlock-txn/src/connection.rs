//! The narrow backend interface consumed by the locking layer.
//!
//! A [`Connection`] wraps one backend session. Every in-flight transaction
//! owns exactly one connection; lock arbitration between transactions is
//! left entirely to the backend's native row locks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use commitlock_common::types::{Oid, SessionId, Tid};
use commitlock_common::BackendResult;

/// How a lock request behaves when the row is held in a conflicting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Fail immediately (`NOWAIT`).
    NoWait,
    /// Block for at most this long.
    Timeout(Duration),
}

impl LockWait {
    /// Returns true for `NOWAIT` requests.
    pub fn is_nowait(&self) -> bool {
        matches!(self, LockWait::NoWait)
    }
}

impl fmt::Display for LockWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockWait::NoWait => write!(f, "NOWAIT"),
            LockWait::Timeout(d) => write!(f, "WAIT {}ms", d.as_millis()),
        }
    }
}

/// What a backend can do, queried once when a connection source is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Shared row locks accept `NOWAIT`.
    pub supports_row_lock_nowait: bool,
    /// The backend can lock and detect conflicts in one server-side call.
    pub supports_atomic_lock_and_detect: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            supports_row_lock_nowait: true,
            supports_atomic_lock_and_detect: true,
        }
    }
}

/// Which assertion a version conflict violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// A read-current assertion no longer holds.
    ReadCurrent,
    /// A stored object was changed since the transaction read it.
    Write,
}

/// A row whose committed version differs from what the transaction expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionConflict {
    /// The object.
    pub oid: Oid,
    /// The version the transaction expected.
    pub expected: Tid,
    /// The version committed at the time of the check.
    pub actual: Tid,
    /// Which assertion was violated.
    pub kind: ConflictKind,
}

/// A locked row and its committed version (`None` if the row doesn't exist).
pub type CurrentRow = (Oid, Option<Tid>);

/// Interrupts a connection from a thread that doesn't own it.
pub trait Canceller: Send + Sync {
    /// Makes the connection's blocked lock request fail at once.
    ///
    /// If nothing is blocked, the connection's next lock request fails
    /// instead, unless the connection rolls back or commits first.
    fn cancel(&self);
}

/// One backend session.
pub trait Connection: Send {
    /// Returns the backend session id, for diagnostics.
    fn session_id(&self) -> SessionId;

    /// Returns the backend's capabilities.
    fn capabilities(&self) -> BackendCapabilities;

    /// Takes exclusive locks on `oids`, waiting at most `timeout` for the
    /// whole statement, and returns each row's committed version.
    fn lock_rows_exclusive(
        &mut self,
        oids: &[Oid],
        timeout: Duration,
    ) -> BackendResult<Vec<CurrentRow>>;

    /// Takes shared locks on `oids` for the duration of the statement and
    /// returns each row's committed version read under the lock.
    fn lock_rows_shared(&mut self, oids: &[Oid], wait: LockWait)
        -> BackendResult<Vec<CurrentRow>>;

    /// Exclusive-locks `modify`, then validates `read_current` under shared
    /// locks, in one server-side call. Returns every version conflict found.
    ///
    /// Errors carry the [`LockPhase`](commitlock_common::LockPhase) that failed.
    fn lock_and_detect_conflicts(
        &mut self,
        modify: &[(Oid, Tid)],
        read_current: &[(Oid, Tid)],
        timeout: Duration,
        shared_wait: LockWait,
    ) -> BackendResult<Vec<VersionConflict>>;

    /// Writes `writes` under a newly allocated version token, then releases
    /// every lock the session holds.
    fn commit(&mut self, writes: &[(Oid, Bytes)]) -> BackendResult<Tid>;

    /// Discards the session's work and releases every lock it holds.
    fn rollback(&mut self) -> BackendResult<()>;

    /// Returns a handle that can interrupt this connection's lock waits.
    ///
    /// Backends that can't interrupt a statement return `None`.
    fn canceller(&self) -> Option<Arc<dyn Canceller>> {
        None
    }
}

/// Opens connections, one per transaction.
pub trait ConnectionSource: Send + Sync {
    /// Returns the backend's capabilities.
    fn capabilities(&self) -> BackendCapabilities;

    /// Opens a new connection.
    fn open(&self) -> BackendResult<Box<dyn Connection>>;
}
