//! Filepath: src/storage/header.rs
//!
//! Per-key record header: a latch plus the head of the version chain.
//!
//! # Protocol
//!
//! ```text
//! put / delete (WRITE txn):
//!   holds write latch     -> reuse
//!   holds read latch      -> upgrade (sole reader only), else FailByActiveTxn
//!   otherwise             -> try_write_lock, else FailByActiveTxn
//!   push uncommitted version as chain head (single CAS)
//!
//! select:
//!   READ txn  -> no latch; first version not newer than the snapshot
//!   WRITE txn -> read latch unless already latched; chain head
//! ```
//!
//! Only the write latch holder changes the chain, so every CAS on the head
//! must succeed.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::AtomicPtr;

use bytes::Bytes;

use crate::config::{Timestamp, TxnId};
use crate::epoch::Reclaimer;
use crate::error::Error;
use crate::latch::{DataLatch, RecordLatch};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD};
use crate::tracing_helpers::trace_log;
use crate::transaction::Transaction;

use super::undo::{UndoKind, UndoRecord};

/// Header of one key's version chain.
pub struct DataHeader<L: RecordLatch = DataLatch> {
    latch: L,
    chain: AtomicPtr<UndoRecord<L>>,
}

// SAFETY: the chain is published through atomics and changed only by the
// write latch holder. Versions are freed through the epoch manager.
unsafe impl<L: RecordLatch> Send for DataHeader<L> {}
// SAFETY: see above.
unsafe impl<L: RecordLatch> Sync for DataHeader<L> {}

impl<L: RecordLatch> Default for DataHeader<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: RecordLatch> DataHeader<L> {
    /// A header with no versions and a free latch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            latch: L::default(),
            chain: AtomicPtr::new(StdPtr::null_mut()),
        }
    }

    /// A header with no versions, write-latched by `owner`.
    ///
    /// Used for keys that are being created, so no other writer can slip in
    /// between publishing the header and writing its first version.
    #[must_use]
    pub fn new_write_locked(owner: TxnId) -> Self {
        Self {
            latch: L::new_write_locked(owner),
            chain: AtomicPtr::new(StdPtr::null_mut()),
        }
    }

    /// The record latch.
    #[inline]
    pub const fn latch(&self) -> &L {
        &self.latch
    }

    /// Write `value` as a new version.
    ///
    /// # Errors
    /// - [`Error::ReadOnlyTransaction`] for READ transactions.
    /// - [`Error::FailByActiveTxn`] if another transaction holds a latch
    ///   that conflicts with the write latch.
    pub fn put(&self, txn: &mut Transaction<'_, L>, value: Bytes) -> Result<(), Error> {
        if txn.is_read_only() {
            return Err(Error::ReadOnlyTransaction);
        }

        self.acquire_write(txn)?;
        self.push_version(txn, UndoKind::Put, value);
        Ok(())
    }

    /// Write a tombstone.
    ///
    /// The write latch stays with `txn` even when the key turns out to be
    /// absent.
    ///
    /// # Errors
    /// - [`Error::ReadOnlyTransaction`] for READ transactions.
    /// - [`Error::FailByActiveTxn`] on latch conflict.
    /// - [`Error::KeyNotExist`] if the newest version is missing or a
    ///   tombstone.
    pub fn delete(&self, txn: &mut Transaction<'_, L>) -> Result<(), Error> {
        if txn.is_read_only() {
            return Err(Error::ReadOnlyTransaction);
        }

        self.acquire_write(txn)?;
        // SAFETY: the write latch pins the head, and `txn` holds an epoch
        // guard.
        if unsafe { Self::visible(self.chain.load(READ_ORD)) }.is_none() {
            return Err(Error::KeyNotExist);
        }

        self.push_version(txn, UndoKind::Delete, Bytes::new());
        Ok(())
    }

    /// Read the version `txn` is allowed to see.
    ///
    /// READ transactions see their snapshot and never fail on latches.
    /// WRITE transactions read the newest version under a read latch, which
    /// includes their own uncommitted writes.
    ///
    /// # Errors
    /// - [`Error::KeyNotExist`] if no version is visible, or the visible
    ///   version is a tombstone.
    /// - [`Error::FailByActiveTxn`] if a WRITE transaction cannot take the
    ///   read latch.
    pub fn select(&self, txn: &mut Transaction<'_, L>) -> Result<Bytes, Error> {
        if txn.is_read_only() {
            let snapshot: Timestamp = txn.timestamp();
            let mut record: *mut UndoRecord<L> = self.chain.load(READ_ORD);

            // SAFETY: `txn` holds an epoch guard, so versions detached while
            // we walk stay allocated.
            while let Some(r) = unsafe { record.as_ref() } {
                if !r.newer_than(snapshot) {
                    break;
                }
                record = r.next();
            }

            // SAFETY: as above.
            return unsafe { Self::visible(record) }.ok_or(Error::KeyNotExist);
        }

        let me: *const Self = self;
        if !txn.holds_write_lock(me) && !txn.holds_read_lock(me) {
            if !self.latch.try_read_lock(txn.id()) {
                trace_log!(txn = txn.id(), "read latch conflict");
                return Err(Error::FailByActiveTxn);
            }
            txn.add_read_lock(me);
        }

        // SAFETY: a latch is held, so no other writer moves the head.
        unsafe { Self::visible(self.chain.load(READ_ORD)) }.ok_or(Error::KeyNotExist)
    }

    /// Payload of `record` if it is a live version.
    ///
    /// # Safety
    /// `record` must be null or point to a version that stays allocated for
    /// the returned borrow.
    unsafe fn visible(record: *const UndoRecord<L>) -> Option<Bytes> {
        // SAFETY: forwarded to the caller.
        let record: &UndoRecord<L> = unsafe { record.as_ref() }?;
        match record.kind() {
            UndoKind::Put => Some(record.payload().clone()),
            UndoKind::Delete => None,
        }
    }

    /// Make sure `txn` holds the write latch.
    fn acquire_write(&self, txn: &mut Transaction<'_, L>) -> Result<(), Error> {
        let me: *const Self = self;

        if txn.holds_write_lock(me) {
            return Ok(());
        }

        if txn.holds_read_lock(me) {
            if !self.latch.upgrade_to_write_lock(txn.id()) {
                trace_log!(txn = txn.id(), "latch upgrade conflict");
                return Err(Error::FailByActiveTxn);
            }
            txn.promote_read_lock(me);
            return Ok(());
        }

        if !self.latch.try_write_lock(txn.id()) {
            trace_log!(txn = txn.id(), "write latch conflict");
            return Err(Error::FailByActiveTxn);
        }
        txn.add_write_lock(me);
        Ok(())
    }

    /// Push an uncommitted version. The caller holds the write latch.
    fn push_version(&self, txn: &mut Transaction<'_, L>, kind: UndoKind, payload: Bytes) {
        let head: *mut UndoRecord<L> = self.chain.load(READ_ORD);
        let record: *mut UndoRecord<L> = Box::into_raw(UndoRecord::new(self, kind, payload, head));

        let published: bool = self
            .chain
            .compare_exchange(head, record, CAS_SUCCESS, CAS_FAILURE)
            .is_ok();
        assert!(published, "version chain moved under the write latch");

        txn.add_version(record);
    }

    /// Unlink `record`, which must be the chain head, during rollback.
    ///
    /// # Safety
    /// The caller holds the write latch and `record` is a live version of
    /// this header.
    pub(crate) unsafe fn unlink_head(&self, record: *mut UndoRecord<L>) {
        // SAFETY: forwarded to the caller.
        let next: *mut UndoRecord<L> = unsafe { (*record).next() };
        let unlinked: bool = self
            .chain
            .compare_exchange(record, next, CAS_SUCCESS, CAS_FAILURE)
            .is_ok();
        assert!(unlinked, "rolled back version is not the chain head");
    }

    /// Drop every version below the newest one visible at `oldest`.
    ///
    /// Detached versions are retired through `reclaimer`. Returns how many.
    ///
    /// # Safety
    /// The caller holds the write latch, and no live snapshot is older than
    /// `oldest`.
    pub(crate) unsafe fn prune(&self, oldest: Timestamp, reclaimer: &Reclaimer) -> usize {
        let mut record: *mut UndoRecord<L> = self.chain.load(READ_ORD);

        // SAFETY: the latch holder is the only one detaching versions.
        while let Some(r) = unsafe { record.as_ref() } {
            if !r.newer_than(oldest) {
                break;
            }
            record = r.next();
        }

        // SAFETY: as above.
        let Some(keep) = (unsafe { record.as_ref() }) else {
            return 0;
        };

        let mut detached: *mut UndoRecord<L> = keep.cut_below();
        let mut retired: usize = 0;
        while !detached.is_null() {
            // SAFETY: the detached tail is reachable only by readers that
            // already hold epoch guards.
            let next: *mut UndoRecord<L> = unsafe { (*detached).next() };
            // SAFETY: each version was leaked from a Box in `push_version`
            // and is retired once.
            unsafe { reclaimer.retire_boxed(detached) };
            detached = next;
            retired += 1;
        }
        retired
    }

    /// Number of versions in the chain.
    pub fn version_count(&mut self) -> usize {
        let mut count: usize = 0;
        let mut record: *mut UndoRecord<L> = *self.chain.get_mut();
        // SAFETY: exclusive access.
        while let Some(r) = unsafe { record.as_ref() } {
            count += 1;
            record = r.next();
        }
        count
    }
}

impl<L: RecordLatch> Drop for DataHeader<L> {
    fn drop(&mut self) {
        let mut record: *mut UndoRecord<L> = *self.chain.get_mut();
        while !record.is_null() {
            // SAFETY: exclusive access. Versions still linked were never
            // retired, so they are freed exactly once here.
            let boxed: Box<UndoRecord<L>> = unsafe { Box::from_raw(record) };
            record = boxed.next();
        }
    }
}

impl<L: RecordLatch + StdFmt::Debug> StdFmt::Debug for DataHeader<L> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("DataHeader")
            .field("latch", &self.latch)
            .finish_non_exhaustive()
    }
}
