//! Engine constants and runtime options.

use std::time::Duration;

/// Logical time used to order commits and snapshots.
pub type Timestamp = u64;

/// Identifier a transaction uses as latch owner.
pub type TxnId = u64;

/// Maximum key length in bytes.
///
/// Inner nodes are split pre-emptively whenever they could not absorb a
/// separator of this size, so every insert stays within node capacity.
pub const MAX_KEY_SIZE: usize = 256;

/// Byte capacity of an inner node's key map.
pub const INNERNODE_SIZE: usize = 4096;

/// Byte capacity of a leaf node's key map.
pub const LEAFNODE_SIZE: usize = 4096;

/// Default interval between two epoch advances.
pub const EPOCH_INTERVAL: Duration = Duration::from_millis(100);

/// Timestamp of a freshly opened engine.
pub const INIT_TIMESTAMP: Timestamp = 1;

/// Timestamp carried by undo records whose transaction has not committed.
pub const MAX_TIMESTAMP: Timestamp = u64::MAX;

/// First transaction id handed out. Zero means "no owner" in latch words.
pub const INIT_TXN_ID: TxnId = 1;

/// Runtime options for [`crate::Database::open_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// How often the background reclaimer advances the epoch and frees
    /// retired memory.
    pub epoch_interval: Duration,

    /// Cut version chains below the oldest live snapshot at commit time.
    pub prune_versions: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            epoch_interval: EPOCH_INTERVAL,
            prune_versions: true,
        }
    }
}

impl Options {
    /// Set the epoch interval.
    #[must_use]
    pub const fn epoch_interval(mut self, interval: Duration) -> Self {
        self.epoch_interval = interval;
        self
    }

    /// Enable or disable version chain pruning.
    #[must_use]
    pub const fn prune_versions(mut self, enabled: bool) -> Self {
        self.prune_versions = enabled;
        self
    }
}
