//! Filepath: src/nodeversion.rs
//!
//! Node version word for optimistic lock coupling.
//!
//! [`NodeVersion`] packs an obsolete flag, a write-lock flag and a change
//! counter into one `u64`. Readers take a snapshot of the version, read the
//! node without locking, then validate that the version did not move. Writers
//! upgrade a snapshot to a write lock and get a [`WriteGuard`] back.
//!
//! # Concurrency Model
//! 1. Readers: `read_lock_or_restart()`, read the node, `check_or_restart(v)`.
//! 2. Writers: `upgrade_to_write_lock_or_restart(v)`, modify, drop the guard.
//!
//! Any failure yields [`Restart`], and the caller starts over from the root.
//!
//! ```rust
//! use olckv::nodeversion::NodeVersion;
//!
//! let version = NodeVersion::new();
//! let v = version.read_lock_or_restart().unwrap();
//! {
//!     let _guard = version.upgrade_to_write_lock_or_restart(v).unwrap();
//!     assert!(version.is_locked());
//! }
//! assert!(version.check_or_restart(v).is_err());
//! ```

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, fence};
use std::time::Duration;

use crate::ordering::{
    CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, UNLOCK_ORD, VERSION_ORD, WRITE_ORD,
};

// ============================================================================
//  Bit Constants
// ============================================================================

/// Obsolete bit: node was unlinked and must not be used again.
const OBSOLETE_BIT: u64 = 1 << 0;

/// Lock bit: a writer holds the node.
const LOCK_BIT: u64 = 1 << 1;

/// Increment that toggles the lock bit. Applied twice per write section, so
/// the counter in bits 2.. advances by one.
const LOCK_STEP: u64 = LOCK_BIT;

/// Spins before the backoff starts yielding.
const SPIN_PHASE: usize = 64;

/// Spins before the backoff starts sleeping.
const YIELD_PHASE: usize = 1024;

// ============================================================================
//  Restart
// ============================================================================

/// Signal that an optimistic operation observed a concurrent change and must
/// start over from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restart;

impl StdFmt::Display for Restart {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "optimistic validation failed, restart required")
    }
}

impl std::error::Error for Restart {}

/// Result of a single optimistic attempt.
pub type OlcResult<T> = Result<T, Restart>;

// ============================================================================
//  NodeVersion
// ============================================================================

/// Version word guarding one tree node.
///
/// # Layout
/// Bits 2-63: change counter | Bit 1: `locked` | Bit 0: `obsolete`
#[derive(Debug)]
pub struct NodeVersion {
    value: AtomicU64,
}

// ============================================================================
//  WriteGuard (Type-State Pattern)
// ============================================================================

/// Proof that the node's write lock is held.
///
/// Only [`NodeVersion::upgrade_to_write_lock_or_restart`] creates one. Dropping
/// the guard releases the lock and bumps the counter. A guard marked with
/// [`WriteGuard::mark_obsolete`] also sets the obsolete bit on release.
///
/// Guards are `!Send` via `PhantomData<*mut ()>`: the lock is released on the
/// thread that took it.
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct WriteGuard<'a> {
    version: &'a NodeVersion,
    locked_value: u64,
    obsolete: bool,
    _marker: PhantomData<*mut ()>,
}

impl StdFmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("WriteGuard")
            .field("locked_value", &self.locked_value)
            .field("obsolete", &self.obsolete)
            .finish()
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // write_unlock: +2 clears the lock bit and carries into the counter.
        // write_unlock_obsolete: +3 additionally sets the obsolete bit.
        let step: u64 = if self.obsolete {
            LOCK_STEP | OBSOLETE_BIT
        } else {
            LOCK_STEP
        };

        self.version
            .value
            .store(self.locked_value.wrapping_add(step), UNLOCK_ORD);
    }
}

impl WriteGuard<'_> {
    /// The version value while locked.
    #[inline]
    #[must_use]
    pub const fn locked_value(&self) -> u64 {
        self.locked_value
    }

    /// Release as obsolete: readers holding an older snapshot restart, and
    /// every later `read_lock_or_restart` fails.
    #[inline]
    pub const fn mark_obsolete(&mut self) {
        self.obsolete = true;
    }

    /// Release the lock (`version += 2`).
    #[inline]
    pub fn write_unlock(self) {
        drop(self);
    }

    /// Release the lock and mark the node obsolete (`version += 3`).
    #[inline]
    pub fn write_unlock_obsolete(mut self) {
        self.mark_obsolete();
        drop(self);
    }
}

impl NodeVersion {
    /// A fresh, unlocked, live version.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Create a version from a raw value.
    ///
    ///  WARN: ONLY FOR TESTING.
    #[must_use]
    pub const fn from_value(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    // ========================================================================
    //  Flag Accessors
    // ========================================================================

    /// Check if a writer holds this node.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        (self.value.load(RELAXED) & LOCK_BIT) != 0
    }

    /// Check if this node was unlinked.
    #[inline]
    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        (self.value.load(RELAXED) & OBSOLETE_BIT) != 0
    }

    /// Get the raw version value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value.load(RELAXED)
    }

    // ========================================================================
    //  Optimistic Reads
    // ========================================================================

    /// Wait until no writer holds the node and return the version.
    ///
    /// # Errors
    /// [`Restart`] if the node is obsolete.
    #[inline]
    pub fn read_lock_or_restart(&self) -> OlcResult<u64> {
        let mut spins: usize = 0;

        loop {
            let version: u64 = self.value.load(VERSION_ORD);

            if version & LOCK_BIT == 0 {
                if version & OBSOLETE_BIT != 0 {
                    return Err(Restart);
                }
                return Ok(version);
            }

            spins += 1;
            backoff(spins);
        }
    }

    /// Succeed iff the version still equals `version`.
    ///
    /// Reads of node contents performed before this call are ordered before
    /// the version reload.
    ///
    /// # Errors
    /// [`Restart`] if any writer touched the node since `version` was taken.
    #[inline]
    pub fn check_or_restart(&self, version: u64) -> OlcResult<()> {
        fence(READ_ORD);

        if self.value.load(RELAXED) == version {
            Ok(())
        } else {
            Err(Restart)
        }
    }

    /// End an optimistic read section. Same check as
    /// [`check_or_restart`](Self::check_or_restart).
    ///
    /// # Errors
    /// [`Restart`] if the version moved.
    #[inline]
    pub fn read_unlock_or_restart(&self, version: u64) -> OlcResult<()> {
        self.check_or_restart(version)
    }

    // ========================================================================
    //  Lock Operations (Type-State Pattern)
    // ========================================================================

    /// Turn an optimistic snapshot into a write lock (`v -> v + 2`).
    ///
    /// # Errors
    /// [`Restart`] if the version moved since `version` was taken.
    #[inline]
    pub fn upgrade_to_write_lock_or_restart(&self, version: u64) -> OlcResult<WriteGuard<'_>> {
        let locked: u64 = version.wrapping_add(LOCK_STEP);

        match self
            .value
            .compare_exchange(version, locked, CAS_SUCCESS, CAS_FAILURE)
        {
            Ok(_) => {
                // Keep the section's relaxed stores after the lock becomes
                // visible; pairs with the fence in `check_or_restart`.
                fence(WRITE_ORD);
                Ok(WriteGuard {
                    version: self,
                    locked_value: locked,
                    obsolete: false,
                    _marker: PhantomData,
                })
            }
            Err(_) => Err(Restart),
        }
    }

    /// Take a fresh snapshot and upgrade it.
    ///
    /// # Errors
    /// [`Restart`] if the node is obsolete or another writer won the race.
    #[inline]
    pub fn write_lock_or_restart(&self) -> OlcResult<WriteGuard<'_>> {
        let version: u64 = self.read_lock_or_restart()?;
        self.upgrade_to_write_lock_or_restart(version)
    }
}

impl Default for NodeVersion {
    fn default() -> Self {
        Self::new()
    }
}

/// Phased backoff while a node is write-locked.
///
/// Phase 1 (0-64): spin. Phase 2 (64-1024): yield. Phase 3: short sleep.
#[inline]
fn backoff(spins: usize) {
    if spins <= SPIN_PHASE {
        std::hint::spin_loop();
    } else if spins <= YIELD_PHASE {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(10));
    }
}

#[cfg(all(test, not(loom), not(miri)))]
mod concurrent_tests;
