//! Error handling for the commit locking layer.
//!
//! This module provides the backend-native error type, the error codes
//! shared with the transaction layer, and configuration errors.

mod backend;
mod config;

pub use backend::{BackendError, ErrorCode, LockPhase, NativeErrorKind};
pub use config::ConfigError;

/// Result type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;
