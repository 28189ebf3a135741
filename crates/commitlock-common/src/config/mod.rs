//! Configuration for the commit locking layer.
//!
//! This module provides configuration structures for the commit
//! coordinator and the backend, loadable from and savable to TOML.

mod locking;

pub use locking::{
    BackendConfig, CommitLockConfig, CommitLockConfigBuilder, LockingConfig, VictimPolicy,
};
