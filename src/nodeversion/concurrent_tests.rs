//! Concurrent tests for `NodeVersion`.
//!
//! These tests verify the atomic operations work correctly under contention.
//! Guarded with `#[cfg(not(miri))]` because Miri doesn't support multi-threading well.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

use super::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;

/// A pair of counters that writers keep equal under the version lock.
///
/// The halves are relaxed atomics, like node contents: only the version
/// protocol keeps a validated pair consistent.
struct Guarded {
    version: NodeVersion,
    pair: (AtomicU64, AtomicU64),
}

#[test]
fn test_concurrent_upgrade_is_exclusive() {
    let version = Arc::new(NodeVersion::new());
    let in_critical = Arc::new(AtomicUsize::new(0));
    let iterations = 1000;
    let num_threads = 4;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let v = Arc::clone(&version);
            let inside = Arc::clone(&in_critical);
            thread::spawn(move || {
                let mut done = 0;
                while done < iterations {
                    let Ok(guard) = v.write_lock_or_restart() else {
                        continue;
                    };
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    guard.write_unlock();
                    done += 1;
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    assert!(!version.is_locked());
    // Each write section advances the counter by one (value by 4).
    assert_eq!(version.value(), (iterations * num_threads) as u64 * 4);
}

#[test]
fn test_validated_reads_are_consistent() {
    let shared = Arc::new(Guarded {
        version: NodeVersion::new(),
        pair: (AtomicU64::new(0), AtomicU64::new(0)),
    });
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let s = Arc::clone(&shared);
        thread::spawn(move || {
            for i in 1..=10_000u64 {
                loop {
                    if let Ok(guard) = s.version.write_lock_or_restart() {
                        s.pair.0.store(i, Ordering::Relaxed);
                        s.pair.1.store(i, Ordering::Relaxed);
                        drop(guard);
                        break;
                    }
                }
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let s = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut validated = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let Ok(v) = s.version.read_lock_or_restart() else {
                        continue;
                    };
                    let a: u64 = s.pair.0.load(Ordering::Relaxed);
                    let b: u64 = s.pair.1.load(Ordering::Relaxed);
                    if s.version.check_or_restart(v).is_ok() {
                        assert_eq!(a, b, "validated read observed a torn pair");
                        validated += 1;
                    }
                }
                validated
            })
        })
        .collect();

    writer.join().expect("writer panicked");
    stop.store(true, Ordering::Relaxed);

    for r in readers {
        r.join().expect("reader panicked");
    }
}

#[test]
fn test_read_lock_waits_for_writer() {
    let version = Arc::new(NodeVersion::new());
    let released = Arc::new(AtomicBool::new(false));

    let guard = version.write_lock_or_restart().unwrap();

    let reader = {
        let v = Arc::clone(&version);
        let released = Arc::clone(&released);
        thread::spawn(move || {
            let snapshot = v.read_lock_or_restart().unwrap();
            assert!(released.load(Ordering::Acquire));
            snapshot
        })
    };

    thread::sleep(std::time::Duration::from_millis(20));
    released.store(true, Ordering::Release);
    drop(guard);

    let snapshot = reader.join().expect("reader panicked");
    assert_eq!(snapshot & LOCK_BIT, 0);
}

#[test]
fn test_obsolete_wakes_waiters_with_restart() {
    let version = Arc::new(NodeVersion::new());
    let guard = version.write_lock_or_restart().unwrap();

    let reader = {
        let v = Arc::clone(&version);
        thread::spawn(move || v.read_lock_or_restart())
    };

    thread::sleep(std::time::Duration::from_millis(10));
    guard.write_unlock_obsolete();

    assert_eq!(reader.join().expect("reader panicked"), Err(Restart));
}
