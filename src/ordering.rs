//! Named memory orderings for node versions, epoch state and version chains.
//!
//! Every atomic access in the crate goes through one of these so that the
//! pairing between a reader's load and a writer's store is visible at the
//! call site.

use std::sync::atomic::Ordering;

/// Loads of shared pointers and words read without holding a lock
/// (root pointer, chain heads, version words during optimistic descent).
/// Pairs with [`WRITE_ORD`] and [`UNLOCK_ORD`].
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Stores that publish a new pointer or value to lock-free readers.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Successful compare-and-swap: version upgrade, chain head swap, retire
/// list push.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Failed compare-and-swap. Only the observed value is needed.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Accesses already ordered by a held lock or latch, and statistics.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Version loads while spinning on a write-locked node.
pub const VERSION_ORD: Ordering = Ordering::Acquire;

/// Version increments that end a write section.
pub const UNLOCK_ORD: Ordering = Ordering::Release;

/// Epoch join handshake: `joining`, `active` and the current-epoch pointer.
/// A single total order lets gc and joiners each see the other's announcement.
pub const EPOCH_ORD: Ordering = Ordering::SeqCst;
