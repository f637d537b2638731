//! Filepath: src/transaction/timestamp.rs
//!
//! Logical clock and registry of live transactions.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt as StdFmt;
use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;

use crate::config::{INIT_TIMESTAMP, Timestamp};
use crate::ordering::{CAS_SUCCESS, READ_ORD};

/// Hands out start and commit timestamps and tracks the start times of live
/// transactions.
///
/// The clock only advances at commit, under the commit lock. Start times
/// are read and registered under the registry lock, so
/// [`oldest_active`](Self::oldest_active) never misses a transaction that
/// is about to start below it.
pub struct TimestampManager {
    time: AtomicU64,

    /// Start time -> number of live transactions that started then.
    active: Mutex<BTreeMap<Timestamp, usize>>,
}

impl Default for TimestampManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampManager {
    /// A clock at [`INIT_TIMESTAMP`] with no live transactions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(INIT_TIMESTAMP),
            active: Mutex::new(BTreeMap::new()),
        }
    }

    /// The current time. New snapshots start here.
    #[inline]
    pub fn current_time(&self) -> Timestamp {
        self.time.load(READ_ORD)
    }

    /// Advance the clock by one tick and return the new time.
    ///
    /// Callers serialize through the commit lock.
    pub fn check_out(&self) -> Timestamp {
        self.time.fetch_add(1, CAS_SUCCESS) + 1
    }

    /// Start time of the oldest live transaction, or the current time when
    /// none is live.
    pub fn oldest_active(&self) -> Timestamp {
        let active = self.active.lock();
        active
            .first_key_value()
            .map_or_else(|| self.current_time(), |(&ts, _)| ts)
    }

    /// Number of live transactions.
    pub fn active_count(&self) -> usize {
        self.active.lock().values().sum()
    }

    /// Register a transaction starting now. Returns its start time.
    pub(crate) fn begin(&self) -> Timestamp {
        let mut active = self.active.lock();
        let ts: Timestamp = self.current_time();
        *active.entry(ts).or_insert(0) += 1;
        ts
    }

    /// Deregister a transaction that started at `ts`.
    pub(crate) fn end(&self, ts: Timestamp) {
        let mut active = self.active.lock();
        match active.entry(ts) {
            Entry::Occupied(mut slot) => {
                *slot.get_mut() -= 1;
                if *slot.get() == 0 {
                    slot.remove();
                }
            }
            Entry::Vacant(_) => debug_assert!(false, "no live transaction started at {ts}"),
        }
    }
}

impl StdFmt::Debug for TimestampManager {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("TimestampManager")
            .field("time", &self.current_time())
            .field("active", &self.active_count())
            .finish()
    }
}
