//! # commitlock-txn
//!
//! Commit-time concurrency control over a row-locking backend.
//!
//! At vote time every transaction:
//!
//! 1. takes exclusive row locks on the objects it modifies, bounded by the
//!    commit lock timeout;
//! 2. takes shared row locks on the objects it only asserted to be current,
//!    with `NOWAIT` where the backend supports it, and compares versions.
//!
//! Lock arbitration between transactions is left to the backend. Whatever
//! the backend reports (a lock wait timeout, a `NOWAIT` rejection, a
//! deadlock) is turned into a typed, retryable [`CommitLockError`].
//!
//! ## Modules
//!
//! - [`connection`]: the backend interface ([`Connection`], [`ConnectionSource`])
//! - [`locker`]: the two halves of the locking protocol
//! - [`strategy`]: atomic and interleaved execution of the protocol
//! - [`classify`]: backend failure classification
//! - [`coordinator`]: the per-transaction state machine
//! - [`retry`]: re-running whole transactions after retryable failures
//!
//! ## Example
//!
//! ```rust,ignore
//! use commitlock_txn::{CommitCoordinator, RetryPolicy, run_with_retry};
//!
//! let coordinator = CommitCoordinator::new(source, config)?;
//! let tid = run_with_retry(&coordinator, &RetryPolicy::default(), |c, txn| {
//!     c.check_current_version(txn, parent, parent_tid)?;
//!     c.store(txn, child, child_tid, payload.clone())?;
//!     c.vote(txn)?;
//!     c.finish(txn)
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod locker;
pub mod retry;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use classify::{classify_conflict, classify_lock_error};
pub use connection::{
    BackendCapabilities, Canceller, ConflictKind, Connection, ConnectionSource, CurrentRow,
    LockWait, VersionConflict,
};
pub use coordinator::{CommitCoordinator, CoordinatorStats, TransactionState};
pub use error::{CommitLockError, LockFailure, TxnResult};
pub use locker::{find_conflicts, Locker, VersionMap};
pub use retry::{run_with_retry, RetryPolicy};
pub use strategy::{
    select_strategy, AtomicStrategy, InterleavedStrategy, LockStrategy, StrategyKind, VoteRequest,
};
