//! Filepath: src/transaction/manager.rs
//!
//! Transaction lifecycle: begin, commit, rollback.
//!
//! # Commit Protocol (WRITE)
//!
//! ```text
//! lock commit mutex
//!   ts = current_time + 1
//!   stamp every written version with ts
//!   prune written chains below the oldest live snapshot
//!   release write latches, then read latches
//!   advance the clock to ts
//! unlock
//! ```
//!
//! Snapshots taken before the clock advances start below `ts` and keep
//! skipping the new versions. Snapshots taken after see all of them.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;

use crate::config::{INIT_TXN_ID, Options, Timestamp, TxnId};
use crate::epoch::Reclaimer;
use crate::latch::RecordLatch;
use crate::ordering::RELAXED;
use crate::tracing_helpers::debug_log;

use super::{TimestampManager, Transaction, TxnKind, TxnState};

/// Transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnStats {
    /// Transactions started.
    pub begun: u64,

    /// Transactions committed.
    pub committed: u64,

    /// Transactions rolled back, explicitly or by drop.
    pub aborted: u64,

    /// Versions detached by commit-time pruning.
    pub pruned: u64,
}

#[derive(Default)]
struct TxnCounters {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    pruned: AtomicU64,
}

/// Starts transactions and serializes their commits.
pub struct TransactionManager {
    timestamps: TimestampManager,
    commit_lock: Mutex<()>,
    next_id: AtomicU64,
    reclaimer: Reclaimer,
    prune_versions: bool,
    counters: TxnCounters,
}

impl TransactionManager {
    /// A manager retiring versions through `reclaimer`.
    #[must_use]
    pub fn new(reclaimer: Reclaimer, options: &Options) -> Self {
        Self {
            timestamps: TimestampManager::new(),
            commit_lock: Mutex::new(()),
            next_id: AtomicU64::new(INIT_TXN_ID),
            reclaimer,
            prune_versions: options.prune_versions,
            counters: TxnCounters::default(),
        }
    }

    /// Start a WRITE transaction.
    pub fn begin_write<L: RecordLatch>(&self) -> Transaction<'_, L> {
        self.begin(TxnKind::Write)
    }

    /// Start a READ transaction on a snapshot of the current time.
    pub fn begin_read<L: RecordLatch>(&self) -> Transaction<'_, L> {
        self.begin(TxnKind::Read)
    }

    /// Commit `txn`. Same as [`Transaction::commit`].
    pub fn commit<L: RecordLatch>(&self, txn: Transaction<'_, L>) {
        debug_assert!(StdPtr::eq(self, txn.manager), "transaction from another manager");
        txn.commit();
    }

    /// Roll back `txn`. Same as [`Transaction::abort`].
    pub fn abort<L: RecordLatch>(&self, txn: Transaction<'_, L>) {
        debug_assert!(StdPtr::eq(self, txn.manager), "transaction from another manager");
        txn.abort();
    }

    /// The logical clock.
    #[inline]
    pub const fn timestamps(&self) -> &TimestampManager {
        &self.timestamps
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> TxnStats {
        TxnStats {
            begun: self.counters.begun.load(RELAXED),
            committed: self.counters.committed.load(RELAXED),
            aborted: self.counters.aborted.load(RELAXED),
            pruned: self.counters.pruned.load(RELAXED),
        }
    }

    fn begin<L: RecordLatch>(&self, kind: TxnKind) -> Transaction<'_, L> {
        let id: TxnId = self.next_id.fetch_add(1, RELAXED);
        let guard = self.reclaimer.join();
        let ts: Timestamp = self.timestamps.begin();
        self.counters.begun.fetch_add(1, RELAXED);

        Transaction::new(self, id, ts, kind, guard)
    }

    pub(super) fn commit_in_place<L: RecordLatch>(&self, txn: &mut Transaction<'_, L>) {
        debug_assert_eq!(txn.state, TxnState::Active);

        if txn.is_read_only() {
            self.counters.committed.fetch_add(1, RELAXED);
            self.finish(txn, TxnState::Committed);
            return;
        }

        let mut pruned: usize = 0;
        {
            let _commit = self.commit_lock.lock();
            let commit_ts: Timestamp = self.timestamps.current_time() + 1;

            for &record in &txn.write_set {
                // SAFETY: our own versions, linked into chains we latch.
                unsafe { (*record).stamp(commit_ts) };
            }

            if self.prune_versions {
                let oldest: Timestamp = self.timestamps.oldest_active();
                for &header in &txn.write_locks {
                    // SAFETY: headers outlive transactions, we hold the write
                    // latch, and no live snapshot starts before `oldest`.
                    pruned += unsafe { (*header).prune(oldest, &self.reclaimer) };
                }
            }

            Self::release_latches(txn);
            self.timestamps.check_out();

            debug_log!(txn = txn.id, commit_ts, versions = txn.write_set.len(), pruned, "commit");
        }

        txn.write_set.clear();
        self.counters.committed.fetch_add(1, RELAXED);
        self.counters.pruned.fetch_add(pruned as u64, RELAXED);
        self.finish(txn, TxnState::Committed);
    }

    pub(super) fn rollback_in_place<L: RecordLatch>(&self, txn: &mut Transaction<'_, L>) {
        debug_assert_eq!(txn.state, TxnState::Active);

        debug_log!(txn = txn.id, versions = txn.write_set.len(), "abort");

        // Newest first: each one is the head of its chain when unlinked.
        for record in txn.write_set.drain(..).rev() {
            // SAFETY: the header outlives the transaction and we hold its
            // write latch. The version stays reachable by snapshot readers
            // until its epoch is reclaimed, and it is retired once.
            unsafe {
                (*(*record).header()).unlink_head(record);
                self.reclaimer.retire_boxed(record);
            }
        }

        Self::release_latches(txn);

        self.counters.aborted.fetch_add(1, RELAXED);
        self.finish(txn, TxnState::Aborted);
    }

    fn release_latches<L: RecordLatch>(txn: &mut Transaction<'_, L>) {
        let owner: TxnId = txn.id;

        for header in txn.write_locks.drain() {
            // SAFETY: headers outlive transactions.
            unsafe { (*header).latch() }.write_unlock(owner);
        }
        for header in txn.read_locks.drain() {
            // SAFETY: as above.
            unsafe { (*header).latch() }.read_unlock();
        }
    }

    fn finish<L: RecordLatch>(&self, txn: &mut Transaction<'_, L>, state: TxnState) {
        self.timestamps.end(txn.timestamp);
        txn.state = state;
    }
}

impl StdFmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("TransactionManager")
            .field("timestamps", &self.timestamps)
            .field("prune_versions", &self.prune_versions)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
