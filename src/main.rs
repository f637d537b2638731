//! Load driver for the database.
//!
//! Runs concurrent put/get workloads against a [`Database`] and reports
//! per-thread throughput, conflicts, and engine counters. A watchdog reports
//! threads that stop making progress.
//!
//! Run with:
//! ```bash
//! cargo run --release -- [threads] [ops_per_thread] [key_space]
//! ```

#![allow(clippy::indexing_slicing)]
#![allow(clippy::cast_precision_loss)]

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use olckv::{Database, Error, Options};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// =============================================================================
// Thread progress tracking for hang detection
// =============================================================================

struct ThreadProgress {
    /// Current operation index for each thread
    current_op: Vec<AtomicUsize>,
    /// Last time each thread made progress
    last_progress_ms: Vec<AtomicU64>,
    done: Vec<AtomicBool>,
    start: Instant,
}

impl ThreadProgress {
    fn new(num_threads: usize) -> Self {
        Self {
            current_op: (0..num_threads).map(|_| AtomicUsize::new(0)).collect(),
            last_progress_ms: (0..num_threads).map(|_| AtomicU64::new(0)).collect(),
            done: (0..num_threads).map(|_| AtomicBool::new(false)).collect(),
            start: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn update(&self, thread_id: usize, op: usize) {
        self.current_op[thread_id].store(op, Ordering::Relaxed);
        self.last_progress_ms[thread_id].store(self.elapsed_ms(), Ordering::Relaxed);
    }

    fn mark_done(&self, thread_id: usize) {
        self.done[thread_id].store(true, Ordering::Relaxed);
    }

    fn report_stuck(&self, timeout_ms: u64) -> Vec<(usize, usize, u64)> {
        let now_ms: u64 = self.elapsed_ms();

        (0..self.done.len())
            .filter(|&i| !self.done[i].load(Ordering::Relaxed))
            .filter_map(|i| {
                let stall: u64 = now_ms.saturating_sub(self.last_progress_ms[i].load(Ordering::Relaxed));
                (stall > timeout_ms).then(|| (i, self.current_op[i].load(Ordering::Relaxed), stall))
            })
            .collect()
    }

    fn all_done(&self) -> bool {
        self.done.iter().all(|d| d.load(Ordering::Relaxed))
    }
}

fn spawn_watchdog(progress: Arc<ThreadProgress>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) && !progress.all_done() {
            thread::sleep(Duration::from_millis(500));
            for (tid, op, stall_ms) in progress.report_stuck(2000) {
                eprintln!("!!! STUCK: thread {tid} at op {op} for {stall_ms}ms");
            }
        }
    })
}

// =============================================================================
// Per-thread results
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct ThreadReport {
    ops: usize,
    conflicts: usize,
    misses: usize,
    elapsed: Duration,
}

impl ThreadReport {
    fn ops_per_sec(&self) -> f64 {
        self.ops as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

fn print_reports(label: &str, reports: &[ThreadReport], wall: Duration) {
    for (t, report) in reports.iter().enumerate() {
        println!(
            "  [T{t:02}] {:>9} ops  {:>12.0} ops/sec  conflicts={} misses={}",
            report.ops,
            report.ops_per_sec(),
            report.conflicts,
            report.misses
        );
    }

    let total: usize = reports.iter().map(|r| r.ops).sum();
    println!(
        "{label} DONE: {total} ops in {wall:?} ({:.0} ops/sec)",
        total as f64 / wall.as_secs_f64().max(f64::EPSILON)
    );
}

fn key_of(n: usize) -> Vec<u8> {
    n.to_string().into_bytes()
}

// =============================================================================
// Workload 01: disjoint puts, then reads of the own range
// =============================================================================

fn run_01_disjoint(db: &Arc<Database>, threads: usize, ops_per_thread: usize) {
    println!("\n{}", "=".repeat(80));
    println!("01: DISJOINT PUT+GET ({threads} threads, {ops_per_thread} keys/thread)");
    println!("{}", "=".repeat(80));

    let progress = Arc::new(ThreadProgress::new(threads));
    let stop = Arc::new(AtomicBool::new(false));
    let watchdog = spawn_watchdog(Arc::clone(&progress), Arc::clone(&stop));
    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let db = Arc::clone(db);
            let progress = Arc::clone(&progress);
            thread::spawn(move || {
                let mut report = ThreadReport::default();
                let begin = Instant::now();
                let base: usize = t * ops_per_thread;

                for i in 0..ops_per_thread {
                    progress.update(t, i);
                    let key: Vec<u8> = key_of(base + i);
                    match db.put(&key, &key) {
                        Ok(()) => {}
                        Err(Error::FailByActiveTxn) => report.conflicts += 1,
                        Err(e) => eprintln!("[T{t:02}] put error: {e}"),
                    }
                    report.ops += 1;
                }

                for i in 0..ops_per_thread {
                    progress.update(t, ops_per_thread + i);
                    if db.get(&key_of(base + i)).is_err() {
                        report.misses += 1;
                    }
                    report.ops += 1;
                }

                progress.mark_done(t);
                report.elapsed = begin.elapsed();
                report
            })
        })
        .collect();

    let reports: Vec<ThreadReport> = handles.into_iter().filter_map(|h| h.join().ok()).collect();
    stop.store(true, Ordering::Relaxed);
    let _ = watchdog.join();

    print_reports("01", &reports, start.elapsed());
}

// =============================================================================
// Workload 02: mixed reads and writes over a shared key space
// =============================================================================

fn run_02_contention(db: &Arc<Database>, threads: usize, ops_per_thread: usize, key_space: usize) {
    println!("\n{}", "=".repeat(80));
    println!("02: CONTENTION 50/50 ({threads} threads, {ops_per_thread} ops/thread, {key_space} keys)");
    println!("{}", "=".repeat(80));

    let progress = Arc::new(ThreadProgress::new(threads));
    let stop = Arc::new(AtomicBool::new(false));
    let watchdog = spawn_watchdog(Arc::clone(&progress), Arc::clone(&stop));
    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let db = Arc::clone(db);
            let progress = Arc::clone(&progress);
            thread::spawn(move || {
                let mut report = ThreadReport::default();
                let begin = Instant::now();
                let mut state: u64 = (t as u64 + 1).wrapping_mul(0x517c_c1b7_2722_0a95);

                for op in 0..ops_per_thread {
                    progress.update(t, op);
                    state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                    let slot: usize = usize::try_from(state >> 33).unwrap_or(0) % key_space;
                    let key: Vec<u8> = key_of(slot);

                    let result: Result<(), Error> = if state & 1 == 0 {
                        db.put(&key, &state.to_le_bytes())
                    } else {
                        db.get(&key).map(|_| ())
                    };
                    match result {
                        Ok(()) => {}
                        Err(Error::FailByActiveTxn) => report.conflicts += 1,
                        Err(Error::KeyNotExist) => report.misses += 1,
                        Err(e) => eprintln!("[T{t:02}] error: {e}"),
                    }
                    report.ops += 1;
                }

                progress.mark_done(t);
                report.elapsed = begin.elapsed();
                report
            })
        })
        .collect();

    let reports: Vec<ThreadReport> = handles.into_iter().filter_map(|h| h.join().ok()).collect();
    stop.store(true, Ordering::Relaxed);
    let _ = watchdog.join();

    print_reports("02", &reports, start.elapsed());
}

// =============================================================================
// Main
// =============================================================================

fn arg_or(index: usize, default: usize) -> usize {
    std::env::args()
        .nth(index)
        .and_then(|arg| arg.parse().ok())
        .filter(|&n: &usize| n > 0)
        .unwrap_or(default)
}

fn main() {
    let threads: usize = arg_or(1, 8);
    let ops_per_thread: usize = arg_or(2, 50_000);
    let key_space: usize = arg_or(3, 10_000);

    eprintln!("olckv load driver");
    eprintln!("=================");
    eprintln!("Watchdog will report any thread stuck for >2 seconds.");

    let db = Arc::new(Database::open_with(
        "load",
        Options::default().epoch_interval(Duration::from_millis(20)),
    ));

    run_01_disjoint(&db, threads, ops_per_thread);
    run_02_contention(&db, threads, ops_per_thread, key_space);

    let stats = db.stats();
    println!("\nkeys={} restarts={}", stats.keys, stats.tree.restarts);
    println!(
        "splits: leaf={} inner={} root={}",
        stats.tree.leaf_splits, stats.tree.inner_splits, stats.tree.root_splits
    );
    println!(
        "txns: begun={} committed={} aborted={} pruned={}",
        stats.txns.begun, stats.txns.committed, stats.txns.aborted, stats.txns.pruned
    );
    println!(
        "epochs: created={} live={} reclaimed={} pending={}",
        stats.epochs.epochs_created, stats.epochs.live_epochs, stats.epochs.reclaimed, stats.epochs.pending
    );

    if let Ok(db) = Arc::try_unwrap(db) {
        db.close();
    }
}
