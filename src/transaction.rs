//! Filepath: src/transaction.rs
//!
//! Transactions over [`DataHeader`] records.
//!
//! A transaction is stamped with the current time when it begins and stays
//! joined to the current epoch until it ends, so every version it can reach
//! stays allocated.
//!
//! | Kind | Reads | Writes | Latches |
//! |------|-------|--------|---------|
//! | READ | snapshot at start time | rejected | none |
//! | WRITE | newest version | new uncommitted versions | read and write latches, held to the end |
//!
//! Dropping a WRITE transaction that was neither committed nor aborted rolls
//! it back. Dropping an unfinished READ transaction counts as a commit.

use std::collections::HashSet;
use std::fmt as StdFmt;

use crate::config::{Timestamp, TxnId};
use crate::epoch::EpochGuard;
use crate::latch::{DataLatch, RecordLatch};
use crate::storage::{DataHeader, UndoRecord};

mod manager;
mod timestamp;

pub use manager::{TransactionManager, TxnStats};
pub use timestamp::TimestampManager;

/// Whether a transaction may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    /// Snapshot reads only. Never takes latches.
    Read,

    /// Reads the newest versions and writes new ones.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// A live transaction.
///
/// Created by [`TransactionManager::begin_write`] or
/// [`TransactionManager::begin_read`]. Records are read and written through
/// [`DataHeader::select`], [`DataHeader::put`] and [`DataHeader::delete`].
pub struct Transaction<'m, L: RecordLatch = DataLatch> {
    manager: &'m TransactionManager,
    id: TxnId,
    timestamp: Timestamp,
    kind: TxnKind,
    state: TxnState,

    /// Versions written, in write order.
    write_set: Vec<*mut UndoRecord<L>>,
    read_locks: HashSet<*const DataHeader<L>>,
    write_locks: HashSet<*const DataHeader<L>>,

    _guard: EpochGuard,
}

impl<'m, L: RecordLatch> Transaction<'m, L> {
    fn new(
        manager: &'m TransactionManager,
        id: TxnId,
        timestamp: Timestamp,
        kind: TxnKind,
        guard: EpochGuard,
    ) -> Self {
        Self {
            manager,
            id,
            timestamp,
            kind,
            state: TxnState::Active,
            write_set: Vec::new(),
            read_locks: HashSet::new(),
            write_locks: HashSet::new(),
            _guard: guard,
        }
    }

    /// Latch owner id.
    #[inline]
    pub const fn id(&self) -> TxnId {
        self.id
    }

    /// Start time. READ transactions see versions committed at or before it.
    #[inline]
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Read or write.
    #[inline]
    pub const fn kind(&self) -> TxnKind {
        self.kind
    }

    /// True for READ transactions.
    #[inline]
    pub const fn is_read_only(&self) -> bool {
        matches!(self.kind, TxnKind::Read)
    }

    /// Number of versions written so far.
    #[inline]
    pub fn write_count(&self) -> usize {
        self.write_set.len()
    }

    /// Make every write visible and release all latches.
    ///
    /// A no-op apart from deregistration for READ transactions.
    pub fn commit(mut self) {
        let manager: &TransactionManager = self.manager;
        manager.commit_in_place(&mut self);
    }

    /// Undo every write and release all latches.
    pub fn abort(mut self) {
        let manager: &TransactionManager = self.manager;
        manager.rollback_in_place(&mut self);
    }

    // ========================================================================
    //  Latch and write bookkeeping (used by DataHeader)
    // ========================================================================

    #[inline]
    pub(crate) fn holds_read_lock(&self, header: *const DataHeader<L>) -> bool {
        self.read_locks.contains(&header)
    }

    #[inline]
    pub(crate) fn holds_write_lock(&self, header: *const DataHeader<L>) -> bool {
        self.write_locks.contains(&header)
    }

    pub(crate) fn add_read_lock(&mut self, header: *const DataHeader<L>) {
        self.read_locks.insert(header);
    }

    pub(crate) fn add_write_lock(&mut self, header: *const DataHeader<L>) {
        self.write_locks.insert(header);
    }

    /// The read latch on `header` was upgraded in place.
    pub(crate) fn promote_read_lock(&mut self, header: *const DataHeader<L>) {
        self.read_locks.remove(&header);
        self.write_locks.insert(header);
    }

    pub(crate) fn add_version(&mut self, record: *mut UndoRecord<L>) {
        self.write_set.push(record);
    }
}

impl<L: RecordLatch> Drop for Transaction<'_, L> {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            let manager: &TransactionManager = self.manager;
            // A READ transaction has nothing to undo, so dropping it ends it
            // the same way `commit` does.
            if self.is_read_only() {
                manager.commit_in_place(self);
            } else {
                manager.rollback_in_place(self);
            }
        }
    }
}

impl<L: RecordLatch> StdFmt::Debug for Transaction<'_, L> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("writes", &self.write_set.len())
            .finish_non_exhaustive()
    }
}
