//! # commitlock-common
//!
//! Common types, errors, and configuration for the commit locking layer.
//!
//! This crate provides the foundational types shared by the backend and the
//! transaction layer:
//!
//! - **Types**: Object identifiers (`Oid`), version tokens (`Tid`),
//!   transaction and session identifiers
//! - **Errors**: Backend-native failures with `BackendError`
//! - **Config**: Commit lock and backend configuration, loadable from TOML
//! - **Constants**: Defaults shared across components
//!
//! ## Example
//!
//! ```rust
//! use commitlock_common::types::{Oid, Tid, TxnId};
//! use commitlock_common::config::CommitLockConfig;
//!
//! let oid = Oid::new(42);
//! let tid = Tid::new(7);
//! assert!(tid > Tid::ZERO);
//! assert_eq!(CommitLockConfig::default().commit_lock_timeout_secs, 30.0);
//! # let _ = (oid, TxnId::new(1));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{BackendError, BackendResult, ErrorCode, LockPhase, NativeErrorKind};
pub use types::{Oid, SessionId, Tid, TxnId};
