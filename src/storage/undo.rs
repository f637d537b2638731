//! Filepath: src/storage/undo.rs
//!
//! One version of a record.

use std::fmt as StdFmt;
use std::sync::atomic::{AtomicPtr, AtomicU64};

use bytes::Bytes;

use crate::config::{MAX_TIMESTAMP, Timestamp};
use crate::latch::{DataLatch, RecordLatch};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

use super::DataHeader;

/// What a version says about its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    /// The key holds the record's payload.
    Put,

    /// The key was deleted. The payload is empty.
    Delete,
}

/// A version in a record's chain, linked newest first.
///
/// The timestamp is [`MAX_TIMESTAMP`] until the writing transaction commits,
/// then the commit time. Snapshot readers skip versions stamped after their
/// start time, so an in-flight version is invisible to all of them.
pub struct UndoRecord<L: RecordLatch = DataLatch> {
    timestamp: AtomicU64,
    next: AtomicPtr<Self>,
    header: *const DataHeader<L>,
    kind: UndoKind,
    payload: Bytes,
}

// SAFETY: `header` is only dereferenced by the transaction that holds the
// header's write latch, and headers outlive every transaction. The rest is
// atomics and an immutable payload.
unsafe impl<L: RecordLatch> Send for UndoRecord<L> {}
// SAFETY: see above.
unsafe impl<L: RecordLatch> Sync for UndoRecord<L> {}

impl<L: RecordLatch> UndoRecord<L> {
    /// An uncommitted version of `header` that sits on top of `next`.
    pub(crate) fn new(
        header: *const DataHeader<L>,
        kind: UndoKind,
        payload: Bytes,
        next: *mut Self,
    ) -> Box<Self> {
        Box::new(Self {
            timestamp: AtomicU64::new(MAX_TIMESTAMP),
            next: AtomicPtr::new(next),
            header,
            kind,
            payload,
        })
    }

    /// Commit time, or [`MAX_TIMESTAMP`] while uncommitted.
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp.load(READ_ORD)
    }

    /// True until the writer commits.
    #[inline]
    pub fn is_uncommitted(&self) -> bool {
        self.timestamp() == MAX_TIMESTAMP
    }

    /// True if a snapshot taken at `ts` cannot see this version.
    #[inline]
    pub fn newer_than(&self, ts: Timestamp) -> bool {
        self.timestamp() > ts
    }

    /// Kind of this version.
    #[inline]
    pub const fn kind(&self) -> UndoKind {
        self.kind
    }

    /// Payload of a [`UndoKind::Put`] version.
    #[inline]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The next older version.
    #[inline]
    pub fn next(&self) -> *mut Self {
        self.next.load(READ_ORD)
    }

    #[inline]
    pub(crate) const fn header(&self) -> *const DataHeader<L> {
        self.header
    }

    /// Publish the commit time.
    #[inline]
    pub(crate) fn stamp(&self, ts: Timestamp) {
        debug_assert!(ts < MAX_TIMESTAMP, "commit timestamp out of range");
        self.timestamp.store(ts, WRITE_ORD);
    }

    /// Detach everything older than this version. Returns the detached
    /// chain.
    #[inline]
    pub(crate) fn cut_below(&self) -> *mut Self {
        self.next.swap(std::ptr::null_mut(), RELAXED)
    }
}

impl<L: RecordLatch> StdFmt::Debug for UndoRecord<L> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("UndoRecord")
            .field("timestamp", &self.timestamp())
            .field("kind", &self.kind)
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr as StdPtr;

    #[test]
    fn test_new_record_is_invisible() {
        let record: Box<UndoRecord> =
            UndoRecord::new(StdPtr::null(), UndoKind::Put, Bytes::from_static(b"v"), StdPtr::null_mut());

        assert!(record.is_uncommitted());
        assert!(record.newer_than(MAX_TIMESTAMP - 1));
        assert!(record.next().is_null());
    }

    #[test]
    fn test_stamp_makes_visible() {
        let record: Box<UndoRecord> =
            UndoRecord::new(StdPtr::null(), UndoKind::Delete, Bytes::new(), StdPtr::null_mut());
        record.stamp(5);

        assert!(!record.is_uncommitted());
        assert!(record.newer_than(4));
        assert!(!record.newer_than(5));
        assert_eq!(record.kind(), UndoKind::Delete);
    }
}
