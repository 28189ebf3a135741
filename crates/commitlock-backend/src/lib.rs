//! # commitlock-backend
//!
//! An in-memory stand-in for a relational backend with native row locks.
//!
//! It provides what the commit locking layer needs from a real database:
//!
//! - **Row locks**: shared and exclusive, with `NOWAIT` and lock wait
//!   timeouts
//! - **Deadlock detection**: a wait-for graph checked while requests block,
//!   with a configurable victim policy
//! - **Versioned rows**: every commit allocates a new, larger [`Tid`]
//!
//! Capabilities (`NOWAIT`, the atomic lock-and-detect call) can be switched
//! off in [`BackendConfig`] to exercise the fallback paths.
//!
//! [`Tid`]: commitlock_common::types::Tid
//! [`BackendConfig`]: commitlock_common::config::BackendConfig

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod deadlock;
pub mod lock;
pub mod session;
pub mod store;

pub use lock::{LockMode, LockStats, LockTableConfig, RowLockTable};
pub use session::{MemoryBackend, Session};
pub use store::{RowStore, StoredRow};
