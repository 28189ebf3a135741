//! System-wide constants for the commit locking layer.

// =============================================================================
// Lock Timeouts
// =============================================================================

/// Default commit lock timeout in seconds.
///
/// Bounds how long a vote may wait for exclusive row locks.
pub const DEFAULT_COMMIT_LOCK_TIMEOUT_SECS: f64 = 30.0;

/// Smallest commit lock timeout accepted by configuration validation (1 ms).
pub const MIN_COMMIT_LOCK_TIMEOUT_SECS: f64 = 0.001;

/// Upper bound for the commit lock timeout (one hour).
pub const MAX_COMMIT_LOCK_TIMEOUT_SECS: f64 = 3600.0;

// =============================================================================
// Deadlock Detection
// =============================================================================

/// Default interval at which blocked lock waiters re-run deadlock detection.
pub const DEFAULT_DEADLOCK_CHECK_INTERVAL_MS: u64 = 100;

/// Marker that every deadlock report carries in its message.
pub const DEADLOCK_MARKER: &str = "deadlock detected";

// =============================================================================
// Retry
// =============================================================================

/// Default number of attempts made by the retry helper.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Default initial backoff for the retry helper, in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 10;

/// Default upper bound for a single retry backoff, in milliseconds.
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 1_000;
