//! Filepath: src/latch.rs
//!
//! Try-only reader/writer latches for single records.
//!
//! Record latches never block: a conflicting request fails immediately and
//! the transaction reports [`Error::FailByActiveTxn`](crate::Error). The first
//! writer wins.
//!
//! | Latch | Writer | Readers | Re-entrant |
//! |-------|--------|---------|------------|
//! | [`DataLatch`] | owner id in bits 0-47 | count in bits 48-63 | yes, per owner |
//! | [`NoWaitRWLatch`] | bit 63 | count in bits 0-62 | no |

use std::fmt as StdFmt;
use std::sync::atomic::AtomicU64;

use crate::config::TxnId;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, UNLOCK_ORD};

// ============================================================================
//  RecordLatch
// ============================================================================

/// A non-blocking reader/writer latch guarding one record.
///
/// `owner` is the caller's transaction id. Latches that do not track owners
/// ignore it.
pub trait RecordLatch: Default + Send + Sync + 'static {
    /// A latch already write-locked by `owner`.
    fn new_write_locked(owner: TxnId) -> Self;

    /// Take the write latch. Fails if any other holder exists.
    fn try_write_lock(&self, owner: TxnId) -> bool;

    /// Take a read latch. Fails if a writer holds the latch.
    fn try_read_lock(&self, owner: TxnId) -> bool;

    /// Turn the caller's read latch into the write latch. Succeeds only if
    /// the caller is the sole reader. On success the read latch is consumed.
    fn upgrade_to_write_lock(&self, owner: TxnId) -> bool;

    /// Release one read latch.
    fn read_unlock(&self);

    /// Release the write latch held by `owner`.
    fn write_unlock(&self, owner: TxnId);

    /// True if nobody holds the latch.
    fn is_free(&self) -> bool;
}

// ============================================================================
//  DataLatch
// ============================================================================

const OWNER_BITS: u32 = 48;
const OWNER_MASK: u64 = (1 << OWNER_BITS) - 1;
const READER_ONE: u64 = 1 << OWNER_BITS;
const FREE: u64 = 0;

/// Owner-aware record latch.
///
/// The write latch stores the owner's id, so a transaction that already
/// holds it can take it again (or take a read latch) without conflict.
#[derive(Default)]
pub struct DataLatch {
    word: AtomicU64,
}

impl DataLatch {
    #[inline]
    const fn writer(word: u64) -> TxnId {
        word & OWNER_MASK
    }

    #[inline]
    const fn readers(word: u64) -> u64 {
        word >> OWNER_BITS
    }

    /// Owner of the write latch, if any.
    #[must_use]
    pub fn write_owner(&self) -> Option<TxnId> {
        let owner: TxnId = Self::writer(self.word.load(READ_ORD));
        (owner != FREE).then_some(owner)
    }

    /// Number of read latches held.
    #[must_use]
    pub fn reader_count(&self) -> u64 {
        Self::readers(self.word.load(READ_ORD))
    }
}

impl RecordLatch for DataLatch {
    fn new_write_locked(owner: TxnId) -> Self {
        debug_assert!(owner != FREE && owner <= OWNER_MASK, "invalid latch owner {owner}");

        Self {
            word: AtomicU64::new(owner),
        }
    }

    fn try_write_lock(&self, owner: TxnId) -> bool {
        debug_assert!(owner != FREE && owner <= OWNER_MASK, "invalid latch owner {owner}");

        let word: u64 = self.word.load(READ_ORD);
        if word == owner {
            return true;
        }
        if word != FREE {
            return false;
        }

        self.word
            .compare_exchange(FREE, owner, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    fn try_read_lock(&self, owner: TxnId) -> bool {
        let mut word: u64 = self.word.load(READ_ORD);

        loop {
            let writer: TxnId = Self::writer(word);
            if writer != FREE {
                // The writer itself may read.
                return writer == owner;
            }

            debug_assert!(Self::readers(word) < (u64::MAX >> OWNER_BITS), "reader count overflow");
            match self
                .word
                .compare_exchange_weak(word, word + READER_ONE, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => return true,
                Err(actual) => word = actual,
            }
        }
    }

    fn upgrade_to_write_lock(&self, owner: TxnId) -> bool {
        self.word
            .compare_exchange(READER_ONE, owner, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    fn read_unlock(&self) {
        let previous: u64 = self.word.fetch_sub(READER_ONE, UNLOCK_ORD);
        debug_assert!(Self::readers(previous) > 0, "read_unlock without a reader");
    }

    fn write_unlock(&self, owner: TxnId) {
        let released: bool = self
            .word
            .compare_exchange(owner, FREE, CAS_SUCCESS, CAS_FAILURE)
            .is_ok();
        assert!(released, "write_unlock by {owner} which does not hold the latch");
    }

    fn is_free(&self) -> bool {
        self.word.load(RELAXED) == FREE
    }
}

impl StdFmt::Debug for DataLatch {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let word: u64 = self.word.load(RELAXED);
        f.debug_struct("DataLatch")
            .field("writer", &Self::writer(word))
            .field("readers", &Self::readers(word))
            .finish()
    }
}

// ============================================================================
//  NoWaitRWLatch
// ============================================================================

const WRITE_LOCKED: u64 = 1 << 63;

/// Anonymous, non-re-entrant record latch.
///
/// A holder must not lock it again, whatever the latch kind.
#[derive(Default)]
pub struct NoWaitRWLatch {
    word: AtomicU64,
}

impl NoWaitRWLatch {
    /// Take the write latch.
    pub fn try_write_lock(&self) -> bool {
        self.word
            .compare_exchange(FREE, WRITE_LOCKED, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Take a read latch.
    pub fn try_read_lock(&self) -> bool {
        let mut word: u64 = self.word.load(READ_ORD);

        loop {
            if word == WRITE_LOCKED {
                return false;
            }
            match self
                .word
                .compare_exchange_weak(word, word + 1, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => return true,
                Err(actual) => word = actual,
            }
        }
    }

    /// Turn the caller's read latch into the write latch, if it is the only
    /// reader.
    pub fn upgrade_to_write_lock(&self) -> bool {
        self.word
            .compare_exchange(1, WRITE_LOCKED, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Release one read latch.
    pub fn read_unlock(&self) {
        let previous: u64 = self.word.fetch_sub(1, UNLOCK_ORD);
        debug_assert!(previous != FREE && previous != WRITE_LOCKED, "read_unlock without a reader");
    }

    /// Release the write latch.
    pub fn write_unlock(&self) {
        debug_assert_eq!(self.word.load(RELAXED), WRITE_LOCKED, "write_unlock without the write latch");
        self.word.store(FREE, UNLOCK_ORD);
    }

    /// True if nobody holds the latch.
    #[must_use]
    pub fn no_lock(&self) -> bool {
        self.word.load(RELAXED) == FREE
    }
}

impl RecordLatch for NoWaitRWLatch {
    fn new_write_locked(_owner: TxnId) -> Self {
        Self {
            word: AtomicU64::new(WRITE_LOCKED),
        }
    }

    fn try_write_lock(&self, _owner: TxnId) -> bool {
        Self::try_write_lock(self)
    }

    fn try_read_lock(&self, _owner: TxnId) -> bool {
        Self::try_read_lock(self)
    }

    fn upgrade_to_write_lock(&self, _owner: TxnId) -> bool {
        Self::upgrade_to_write_lock(self)
    }

    fn read_unlock(&self) {
        Self::read_unlock(self);
    }

    fn write_unlock(&self, _owner: TxnId) {
        Self::write_unlock(self);
    }

    fn is_free(&self) -> bool {
        self.no_lock()
    }
}

impl StdFmt::Debug for NoWaitRWLatch {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let word: u64 = self.word.load(RELAXED);
        f.debug_struct("NoWaitRWLatch")
            .field("write_locked", &(word == WRITE_LOCKED))
            .field("readers", &if word == WRITE_LOCKED { 0 } else { word })
            .finish()
    }
}
