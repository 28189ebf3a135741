//! # commitlock-test
//!
//! Harness for driving the commit locking layer against the in-memory
//! backend from several threads.
//!
//! - [`Fixture`]: a backend plus a coordinator, with helpers to create
//!   objects and stage transactions
//! - [`BackendProfile`]: which backend capabilities a run uses
//! - [`Rendezvous`]: a reusable meeting point for forcing interleavings
//! - [`init_tracing`]: log output for test runs, filtered by `RUST_LOG`

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use commitlock_backend::MemoryBackend;
use commitlock_common::config::{BackendConfig, CommitLockConfig, LockingConfig, VictimPolicy};
use commitlock_common::types::{Oid, Tid, TxnId};
use commitlock_txn::{CommitCoordinator, TxnResult};
use parking_lot::{Condvar, Mutex};
use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber for the current test binary.
///
/// Safe to call from every test; only the first call has an effect.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(true)
        .try_init();
}

/// Backend capabilities for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendProfile {
    /// Display name used in assertion messages.
    pub name: &'static str,
    /// Shared locks accept `NOWAIT`.
    pub nowait: bool,
    /// The backend offers the atomic lock-and-detect call.
    pub atomic: bool,
}

impl BackendProfile {
    /// Atomic strategy with `NOWAIT`.
    pub const ATOMIC: Self = Self {
        name: "atomic",
        nowait: true,
        atomic: true,
    };
    /// Interleaved strategy with `NOWAIT`.
    pub const INTERLEAVED: Self = Self {
        name: "interleaved",
        nowait: true,
        atomic: false,
    };
    /// Interleaved strategy on a backend without `NOWAIT`.
    pub const BLOCKING: Self = Self {
        name: "interleaved-blocking",
        nowait: false,
        atomic: false,
    };

    /// Every profile.
    pub const ALL: [Self; 3] = [Self::ATOMIC, Self::INTERLEAVED, Self::BLOCKING];

    /// Returns the backend configuration for this profile.
    pub fn backend_config(&self, victim_policy: VictimPolicy) -> BackendConfig {
        BackendConfig {
            supports_row_lock_nowait: self.nowait,
            supports_atomic_lock_and_detect: self.atomic,
            deadlock_detection: true,
            deadlock_check_interval_ms: 10,
            victim_policy,
        }
    }
}

/// A backend and a coordinator over it.
#[derive(Debug)]
pub struct Fixture {
    /// The backend.
    pub backend: MemoryBackend,
    /// The coordinator, shareable across threads.
    pub coordinator: Arc<CommitCoordinator>,
    next_oid: AtomicU64,
}

impl Fixture {
    /// Creates a fixture for `profile` with the given commit lock timeout.
    pub fn new(profile: BackendProfile, commit_lock_timeout: Duration) -> Self {
        Self::with_policy(profile, commit_lock_timeout, VictimPolicy::default())
    }

    /// Creates a fixture with an explicit deadlock victim policy.
    pub fn with_policy(
        profile: BackendProfile,
        commit_lock_timeout: Duration,
        victim_policy: VictimPolicy,
    ) -> Self {
        let config = LockingConfig {
            commit: CommitLockConfig::builder()
                .commit_lock_timeout(commit_lock_timeout)
                .build(),
            backend: profile.backend_config(victim_policy),
        };
        Self::from_config(&config)
    }

    /// Creates a fixture from a full configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn from_config(config: &LockingConfig) -> Self {
        init_tracing();
        let backend = MemoryBackend::new(config.backend.clone()).expect("valid backend config");
        let coordinator = CommitCoordinator::new(Arc::new(backend.clone()), config.commit.clone())
            .expect("valid commit lock config");
        Self {
            backend,
            coordinator: Arc::new(coordinator),
            next_oid: AtomicU64::new(1),
        }
    }

    /// Creates `count` objects in one committed transaction.
    ///
    /// Returns each new object with its committed version.
    pub fn store_objects(&self, count: usize) -> TxnResult<Vec<(Oid, Tid)>> {
        let coordinator = &self.coordinator;
        let txn = coordinator.begin()?;
        let oids: Vec<Oid> = (0..count)
            .map(|_| Oid::new(self.next_oid.fetch_add(1, Ordering::Relaxed)))
            .collect();
        for oid in &oids {
            coordinator.store(txn, *oid, Tid::ZERO, Bytes::from(format!("object {}", oid)))?;
        }
        coordinator.vote(txn)?;
        let tid = coordinator.finish(txn)?;
        Ok(oids.into_iter().map(|oid| (oid, tid)).collect())
    }

    /// Begins a transaction that modifies `modify` and asserts `read_current`.
    pub fn prepare(&self, modify: &[(Oid, Tid)], read_current: &[(Oid, Tid)]) -> TxnResult<TxnId> {
        let coordinator = &self.coordinator;
        let txn = coordinator.begin()?;
        for (oid, tid) in modify {
            coordinator.store(txn, *oid, *tid, Bytes::from(format!("{} by {}", oid, txn)))?;
        }
        for (oid, tid) in read_current {
            coordinator.check_current_version(txn, *oid, *tid)?;
        }
        Ok(txn)
    }
}

#[derive(Debug, Default)]
struct RendezvousState {
    arrived: usize,
    generation: u64,
}

/// A reusable meeting point for a fixed number of threads.
#[derive(Debug)]
pub struct Rendezvous {
    parties: usize,
    state: Mutex<RendezvousState>,
    all_arrived: Condvar,
}

impl Rendezvous {
    /// Creates a rendezvous for `parties` threads.
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(RendezvousState::default()),
            all_arrived: Condvar::new(),
        }
    }

    /// Blocks until every party has arrived.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        let generation = state.generation;
        if self.arrive(&mut state) {
            return;
        }
        while state.generation == generation {
            self.all_arrived.wait(&mut state);
        }
    }

    /// Like [`Rendezvous::wait`], but gives up after `timeout`.
    ///
    /// Returns false if the others didn't arrive in time; the caller's
    /// arrival is withdrawn.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let generation = state.generation;
        if self.arrive(&mut state) {
            return true;
        }
        while state.generation == generation {
            if self.all_arrived.wait_until(&mut state, deadline).timed_out()
                && state.generation == generation
            {
                state.arrived -= 1;
                return false;
            }
        }
        true
    }

    /// Records an arrival; releases everyone if it was the last one.
    fn arrive(&self, state: &mut RendezvousState) -> bool {
        state.arrived += 1;
        if state.arrived < self.parties {
            return false;
        }
        state.arrived = 0;
        state.generation += 1;
        self.all_arrived.notify_all();
        true
    }
}
