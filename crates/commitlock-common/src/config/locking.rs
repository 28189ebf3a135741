//! Locking configuration structures.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_COMMIT_LOCK_TIMEOUT_SECS, DEFAULT_DEADLOCK_CHECK_INTERVAL_MS,
    MAX_COMMIT_LOCK_TIMEOUT_SECS, MIN_COMMIT_LOCK_TIMEOUT_SECS,
};
use crate::error::ConfigError;

/// Top-level locking configuration.
///
/// # Example
///
/// ```rust
/// use commitlock_common::config::LockingConfig;
///
/// let config: LockingConfig = toml::from_str(r#"
///     [commit]
///     commit_lock_timeout_secs = 0.5
///
///     [backend]
///     supports_row_lock_nowait = false
/// "#).unwrap();
/// assert_eq!(config.commit.commit_lock_timeout_secs, 0.5);
/// assert!(!config.backend.supports_row_lock_nowait);
/// assert!(config.backend.supports_atomic_lock_and_detect);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Commit coordinator configuration.
    #[serde(default)]
    pub commit: CommitLockConfig,

    /// Backend configuration.
    #[serde(default)]
    pub backend: BackendConfig,
}

impl LockingConfig {
    /// Creates a configuration with small timeouts for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            commit: CommitLockConfig {
                commit_lock_timeout_secs: 1.0,
                ..Default::default()
            },
            backend: BackendConfig {
                deadlock_check_interval_ms: 10,
                ..Default::default()
            },
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Converts configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.commit.validate()?;
        self.backend.validate()
    }
}

/// Commit coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitLockConfig {
    /// How long a vote may wait for exclusive row locks, in seconds.
    /// Also bounds shared lock waits when NOWAIT is not in use.
    /// Default: 30
    #[serde(default = "default_commit_lock_timeout")]
    pub commit_lock_timeout_secs: f64,

    /// Always run the two-step (interleavable) locking strategy, even when
    /// the backend offers an atomic lock-and-detect primitive.
    /// Default: false
    #[serde(default)]
    pub force_interleavable: bool,

    /// Never use NOWAIT for read-current locks; block up to the commit lock
    /// timeout instead.
    /// Default: false
    #[serde(default)]
    pub force_shared_lock_blocking: bool,
}

fn default_commit_lock_timeout() -> f64 {
    DEFAULT_COMMIT_LOCK_TIMEOUT_SECS
}

impl Default for CommitLockConfig {
    fn default() -> Self {
        Self {
            commit_lock_timeout_secs: default_commit_lock_timeout(),
            force_interleavable: false,
            force_shared_lock_blocking: false,
        }
    }
}

impl CommitLockConfig {
    /// Creates a builder for configuration.
    #[must_use]
    pub fn builder() -> CommitLockConfigBuilder {
        CommitLockConfigBuilder::new()
    }

    /// Returns the commit lock timeout as a `Duration`.
    ///
    /// Out-of-range values are clamped; `validate` reports them.
    #[must_use]
    pub fn commit_lock_timeout(&self) -> Duration {
        let secs = if self.commit_lock_timeout_secs.is_finite() {
            self.commit_lock_timeout_secs
                .clamp(MIN_COMMIT_LOCK_TIMEOUT_SECS, MAX_COMMIT_LOCK_TIMEOUT_SECS)
        } else {
            DEFAULT_COMMIT_LOCK_TIMEOUT_SECS
        };
        Duration::from_secs_f64(secs)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secs = self.commit_lock_timeout_secs;
        if !secs.is_finite()
            || secs < MIN_COMMIT_LOCK_TIMEOUT_SECS
            || secs > MAX_COMMIT_LOCK_TIMEOUT_SECS
        {
            return Err(ConfigError::invalid(format!(
                "commit_lock_timeout_secs must be between {} and {}, got {}",
                MIN_COMMIT_LOCK_TIMEOUT_SECS, MAX_COMMIT_LOCK_TIMEOUT_SECS, secs
            )));
        }
        Ok(())
    }
}

/// Builder for commit lock configuration.
#[derive(Debug, Default)]
pub struct CommitLockConfigBuilder {
    config: CommitLockConfig,
}

impl CommitLockConfigBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the commit lock timeout.
    #[must_use]
    pub fn commit_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.commit_lock_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Forces the two-step locking strategy.
    #[must_use]
    pub fn force_interleavable(mut self, enabled: bool) -> Self {
        self.config.force_interleavable = enabled;
        self
    }

    /// Forces blocking (non-NOWAIT) read-current locks.
    #[must_use]
    pub fn force_shared_lock_blocking(mut self, enabled: bool) -> Self {
        self.config.force_shared_lock_blocking = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> CommitLockConfig {
        self.config
    }
}

/// How the backend picks which member of a deadlock cycle to roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimPolicy {
    /// Roll back the session whose lock request closed the cycle.
    #[default]
    Requester,
    /// Roll back the session that has been waiting longest.
    OldestWaiter,
    /// Roll back the session that is cheapest to redo (youngest, least work).
    LowestCost,
}

/// Backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Whether shared row locks may be requested with NOWAIT.
    /// Default: true
    #[serde(default = "default_true")]
    pub supports_row_lock_nowait: bool,

    /// Whether the backend offers a single-call lock-and-detect primitive.
    /// Default: true
    #[serde(default = "default_true")]
    pub supports_atomic_lock_and_detect: bool,

    /// Whether the backend runs deadlock detection on lock waits.
    /// Default: true
    #[serde(default = "default_true")]
    pub deadlock_detection: bool,

    /// How often a blocked waiter re-checks for deadlocks, in milliseconds.
    /// Default: 100
    #[serde(default = "default_deadlock_check_interval")]
    pub deadlock_check_interval_ms: u64,

    /// Deadlock victim selection.
    /// Default: requester
    #[serde(default)]
    pub victim_policy: VictimPolicy,
}

fn default_true() -> bool {
    true
}

fn default_deadlock_check_interval() -> u64 {
    DEFAULT_DEADLOCK_CHECK_INTERVAL_MS
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            supports_row_lock_nowait: true,
            supports_atomic_lock_and_detect: true,
            deadlock_detection: true,
            deadlock_check_interval_ms: default_deadlock_check_interval(),
            victim_policy: VictimPolicy::default(),
        }
    }
}

impl BackendConfig {
    /// Returns the deadlock check interval as a `Duration`.
    #[must_use]
    pub fn deadlock_check_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_check_interval_ms.max(1))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deadlock_check_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "deadlock_check_interval_ms must be at least 1",
            ));
        }
        Ok(())
    }
}
