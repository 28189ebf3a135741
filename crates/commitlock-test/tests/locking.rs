//! Lock contention scenarios run against every backend profile.
//!
//! Each scenario uses two transactions over two objects X and Y and checks
//! both which typed error the loser sees and how long it took to see it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use commitlock_common::config::{CommitLockConfig, LockingConfig, VictimPolicy};
use commitlock_common::types::{Oid, Tid, TxnId};
use commitlock_test::{BackendProfile, Fixture, Rendezvous};
use commitlock_txn::{run_with_retry, CommitLockError, LockFailure, RetryPolicy, TransactionState};
use tempfile::TempDir;
use tracing::info;

const DEADLOCK_BOUND: Duration = Duration::from_secs(3);

/// Both transactions read-current X and modify Y.
#[test]
fn test_identical_pattern_times_out_on_modify() {
    for profile in BackendProfile::ALL {
        let fixture = Fixture::new(profile, Duration::from_millis(100));
        let coord = &fixture.coordinator;
        let objects = fixture.store_objects(2).unwrap();
        let (x, y) = (objects[0], objects[1]);

        let first = fixture.prepare(&[y], &[x]).unwrap();
        coord.vote(first).unwrap();

        let second = fixture.prepare(&[y], &[x]).unwrap();
        let start = Instant::now();
        let err = coord.vote(second).unwrap_err();
        let elapsed = start.elapsed();

        info!(profile = profile.name, ?elapsed, error = %err, "identical pattern");
        assert!(
            elapsed <= Duration::from_millis(300),
            "{}: took {:?}",
            profile.name,
            elapsed
        );
        assert!(
            matches!(
                err,
                CommitLockError::UnableToLockRowsToModify {
                    failure: LockFailure::Timeout { .. },
                    ..
                }
            ),
            "{}: unexpected error {}",
            profile.name,
            err
        );
        assert!(err.is_retryable());
        assert_eq!(coord.state(second), Some(TransactionState::Aborted));

        coord.abort(second);
        coord.finish(first).unwrap();
    }
}

/// A modifies X and reads-current Y; B modifies Y and reads-current X.
#[test]
fn test_opposite_pattern_fails_on_read_current() {
    for profile in BackendProfile::ALL {
        let fixture = Fixture::new(profile, Duration::from_secs(1));
        let coord = &fixture.coordinator;
        let objects = fixture.store_objects(2).unwrap();
        let (x, y) = (objects[0], objects[1]);

        let a = fixture.prepare(&[x], &[y]).unwrap();
        coord.vote(a).unwrap();

        let b = fixture.prepare(&[y], &[x]).unwrap();
        let start = Instant::now();
        let err = coord.vote(b).unwrap_err();
        let elapsed = start.elapsed();

        info!(profile = profile.name, ?elapsed, error = %err, "opposite pattern");
        let bound = if profile.nowait {
            Duration::from_secs(1)
        } else {
            Duration::from_millis(2500)
        };
        assert!(elapsed <= bound, "{}: took {:?}", profile.name, elapsed);
        if profile.nowait {
            assert!(elapsed < Duration::from_millis(500), "{}: NOWAIT blocked", profile.name);
        }
        match &err {
            CommitLockError::UnableToLockRowsToReadCurrent { oids, failure, .. } => {
                assert_eq!(oids, &vec![x.0]);
                let expected_nowait = profile.nowait;
                assert_eq!(
                    matches!(failure, LockFailure::NoWait),
                    expected_nowait,
                    "{}: {}",
                    profile.name,
                    failure
                );
            }
            other => panic!("{}: unexpected error {}", profile.name, other),
        }

        coord.abort(b);
        coord.finish(a).unwrap();
    }
}

/// A holds its exclusive lock on X and hasn't validated yet; B modifies Y
/// and reads-current X with the default commit lock timeout. With NOWAIT,
/// B fails on X long before that timeout, and A then completes.
#[test]
fn test_interleaved_conflicting_read_current() {
    for profile in [BackendProfile::ATOMIC, BackendProfile::INTERLEAVED] {
        let config = LockingConfig {
            commit: CommitLockConfig::default(),
            backend: profile.backend_config(VictimPolicy::default()),
        };
        let fixture = Fixture::from_config(&config);
        let coord = &fixture.coordinator;
        assert!(coord.locker().commit_lock_timeout() >= Duration::from_secs(10));
        let objects = fixture.store_objects(2).unwrap();
        let (x, y) = (objects[0], objects[1]);

        let a = fixture.prepare(&[x], &[y]).unwrap();
        coord.lock_for_write(a).unwrap();

        let b = fixture.prepare(&[y], &[x]).unwrap();
        let start = Instant::now();
        let err = coord.vote(b).unwrap_err();
        let elapsed = start.elapsed();

        info!(profile = profile.name, ?elapsed, error = %err, "interleaved read-current");
        assert!(elapsed <= Duration::from_secs(3), "{}: took {:?}", profile.name, elapsed);
        match &err {
            CommitLockError::UnableToLockRowsToReadCurrent { oids, .. } => {
                assert_eq!(oids, &vec![x.0], "{}", profile.name);
            }
            other => panic!("{}: unexpected error {}", profile.name, other),
        }
        assert!(err.is_retryable());
        coord.abort(b);

        coord.validate_read_current(a, None).unwrap();
        coord.finish(a).unwrap();
        assert_eq!(fixture.backend.lock_table().lock_count(), 0);
    }
}

/// Aborts `waiter` from this thread while another thread's vote on it is
/// blocked in the backend. Returns how long the abort took.
fn abort_blocked_vote(fixture: &Fixture, waiter: TxnId) -> Duration {
    let coord = &fixture.coordinator;
    let voter = {
        let coord = Arc::clone(coord);
        thread::spawn(move || coord.vote(waiter))
    };
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    coord.abort(waiter);
    let elapsed = start.elapsed();

    assert!(voter.join().unwrap().is_err());
    assert_eq!(coord.state(waiter), Some(TransactionState::Aborted));
    elapsed
}

#[test]
fn test_abort_interrupts_blocked_vote() {
    for profile in BackendProfile::ALL {
        let fixture = Fixture::new(profile, Duration::from_secs(5));
        let coord = &fixture.coordinator;
        let objects = fixture.store_objects(2).unwrap();
        let (x, y) = (objects[0], objects[1]);

        let holder = fixture.prepare(&[x], &[]).unwrap();
        coord.vote(holder).unwrap();

        // Blocked on the exclusive lock.
        let waiter = fixture.prepare(&[x], &[]).unwrap();
        let elapsed = abort_blocked_vote(&fixture, waiter);
        info!(profile = profile.name, ?elapsed, "abort of blocked vote");
        assert!(elapsed < Duration::from_secs(1), "{}: took {:?}", profile.name, elapsed);

        if !profile.nowait {
            // Blocked on the shared lock, holding its own exclusive lock.
            let waiter = fixture.prepare(&[y], &[x]).unwrap();
            let elapsed = abort_blocked_vote(&fixture, waiter);
            assert!(elapsed < Duration::from_secs(1), "{}: took {:?}", profile.name, elapsed);
        }

        assert_eq!(fixture.backend.lock_table().lock_count(), 1);
        coord.finish(holder).unwrap();
        assert_eq!(fixture.backend.lock_table().lock_count(), 0);
    }
}

/// Runs the forced deadlock: both take exclusive locks, meet, then both
/// request blocking shared locks on the other's row.
fn run_forced_deadlock(fixture: &Fixture) -> Vec<Result<(), CommitLockError>> {
    let coord = &fixture.coordinator;
    let objects = fixture.store_objects(2).unwrap();
    let (x, y) = (objects[0], objects[1]);

    let a = fixture.prepare(&[x], &[y]).unwrap();
    let b = fixture.prepare(&[y], &[x]).unwrap();
    coord.lock_for_write(a).unwrap();
    coord.lock_for_write(b).unwrap();

    let rendezvous = Arc::new(Rendezvous::new(2));
    let handles: Vec<_> = [a, b]
        .into_iter()
        .map(|txn| {
            let coord = Arc::clone(coord);
            let rendezvous = Arc::clone(&rendezvous);
            thread::spawn(move || {
                assert!(rendezvous.wait_timeout(Duration::from_secs(5)));
                coord.validate_read_current(txn, Some(false))
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    for (txn, result) in [a, b].into_iter().zip(&results) {
        match result {
            Ok(()) => {
                coord.finish(txn).unwrap();
            }
            Err(_) => coord.abort(txn),
        }
    }
    results
}

#[test]
fn test_forced_deadlock_reports_one_side() {
    let policies = [
        VictimPolicy::Requester,
        VictimPolicy::OldestWaiter,
        VictimPolicy::LowestCost,
    ];
    for profile in [BackendProfile::INTERLEAVED, BackendProfile::BLOCKING] {
        for policy in policies {
            // Long enough that no lock wait can time out first.
            let fixture = Fixture::with_policy(profile, Duration::from_secs(30), policy);
            assert!(fixture.coordinator.locker().commit_lock_timeout() >= Duration::from_secs(10));

            let start = Instant::now();
            let results = run_forced_deadlock(&fixture);
            let elapsed = start.elapsed();

            let errors: Vec<&CommitLockError> =
                results.iter().filter_map(|r| r.as_ref().err()).collect();
            info!(profile = profile.name, ?policy, ?elapsed, "forced deadlock");

            assert_eq!(errors.len(), 1, "{} / {:?}: {:?}", profile.name, policy, errors);
            let err = errors[0];
            assert!(err.is_deadlock());
            assert!(err.is_retryable());
            assert!(err.to_string().to_lowercase().contains("deadlock"));
            assert!(matches!(
                err,
                CommitLockError::UnableToLockRowsToReadCurrent { .. }
            ));
            assert!(elapsed <= DEADLOCK_BOUND, "took {:?}", elapsed);

            let stats = fixture.coordinator.stats();
            assert_eq!(stats.deadlocks.load(Ordering::Relaxed), 1);
            assert_eq!(fixture.backend.lock_table().stats().deadlocks.load(Ordering::Relaxed), 1);
            assert_eq!(fixture.backend.lock_table().lock_count(), 0);
        }
    }
}

#[test]
fn test_deadlock_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locking.toml");
    std::fs::write(
        &path,
        r#"
[commit]
commit_lock_timeout_secs = 20.0
force_interleavable = true

[backend]
supports_row_lock_nowait = false
deadlock_check_interval_ms = 5
victim_policy = "oldest_waiter"
"#,
    )
    .unwrap();

    let config = LockingConfig::from_file(&path).unwrap();
    let fixture = Fixture::from_config(&config);
    let results = run_forced_deadlock(&fixture);
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
}

#[test]
fn test_abort_is_idempotent() {
    let fixture = Fixture::new(BackendProfile::ATOMIC, Duration::from_millis(50));
    let coord = &fixture.coordinator;
    let objects = fixture.store_objects(2).unwrap();
    let (x, y) = (objects[0], objects[1]);

    let holder = fixture.prepare(&[y], &[]).unwrap();
    coord.vote(holder).unwrap();

    let loser = fixture.prepare(&[x, y], &[]).unwrap();
    assert!(coord.vote(loser).is_err());

    coord.abort(loser);
    let locks = fixture.backend.lock_table().lock_count();
    let releases = fixture
        .backend
        .lock_table()
        .stats()
        .releases
        .load(Ordering::Relaxed);

    coord.abort(loser);
    coord.abort(loser);
    assert_eq!(fixture.backend.lock_table().lock_count(), locks);
    assert_eq!(
        fixture
            .backend
            .lock_table()
            .stats()
            .releases
            .load(Ordering::Relaxed),
        releases
    );
    assert_eq!(coord.stats().aborted.load(Ordering::Relaxed), 1);
    assert_eq!(coord.state(loser), Some(TransactionState::Aborted));

    coord.finish(holder).unwrap();
    assert_eq!(fixture.backend.lock_table().lock_count(), 0);
}

#[test]
fn test_stale_read_current_assertion() {
    for profile in BackendProfile::ALL {
        let fixture = Fixture::new(profile, Duration::from_secs(1));
        let coord = &fixture.coordinator;
        let objects = fixture.store_objects(2).unwrap();
        let (x, y) = (objects[0], objects[1]);

        let writer = fixture.prepare(&[x], &[]).unwrap();
        coord.vote(writer).unwrap();
        let new_tid = coord.finish(writer).unwrap();

        let reader = fixture.prepare(&[y], &[x]).unwrap();
        match coord.vote(reader).unwrap_err() {
            CommitLockError::ReadConflict {
                oid,
                expected,
                actual,
                ..
            } => {
                assert_eq!(oid, x.0);
                assert_eq!(expected, x.1);
                assert_eq!(actual, new_tid);
            }
            other => panic!("{}: unexpected error {}", profile.name, other),
        }
        coord.abort(reader);
    }
}

#[test]
fn test_concurrent_increments_with_retry() {
    const THREADS: usize = 4;
    const INCREMENTS: usize = 5;

    let fixture = Arc::new(Fixture::new(BackendProfile::ATOMIC, Duration::from_secs(1)));
    let counter = fixture.store_objects(1).unwrap()[0].0;
    let policy = RetryPolicy {
        max_attempts: 100,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(20),
        retry_read_conflicts: true,
    };

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let fixture = Arc::clone(&fixture);
            let policy = policy.clone();
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    run_with_retry(&fixture.coordinator, &policy, |coord, txn| {
                        let (value, tid) = read_counter(&fixture, counter);
                        coord.store(txn, counter, tid, Bytes::from((value + 1).to_string()))?;
                        coord.vote(txn)?;
                        coord.finish(txn)
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let (value, _) = read_counter(&fixture, counter);
    assert_eq!(value, (THREADS * INCREMENTS) as u64);
    assert_eq!(fixture.coordinator.active_count(), 0);
}

fn read_counter(fixture: &Fixture, oid: Oid) -> (u64, Tid) {
    let row = fixture.backend.read(oid).unwrap();
    let value = std::str::from_utf8(&row.data)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (value, row.tid)
}
