//! Filepath: src/leaf.rs
//!
//! Leaf node of the B+tree.
//!
//! Leaves store the keys and their fixed-size values in a [`KeyMap`], plus
//! `prev`/`next` links to their neighbours at the leaf level. For the
//! database the value is a handle to a record header.

use std::cmp::Ordering as CmpOrdering;
use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::AtomicPtr;

use crate::config::LEAFNODE_SIZE;
use crate::keymap::{KeyMap, SlotValue};
use crate::node::{NodeHeader, NodePtr};
use crate::nodeversion::{NodeVersion, WriteGuard};
use crate::ordering::{READ_ORD, WRITE_ORD};

/// Key map of a leaf node.
pub type LeafKeyMap<V> = KeyMap<V, LEAFNODE_SIZE>;

// ============================================================================
//  LeafNode
// ============================================================================

/// A leaf node holding `key -> V` entries.
#[repr(C)]
pub struct LeafNode<V: SlotValue> {
    header: NodeHeader,
    prev: AtomicPtr<Self>,
    next: AtomicPtr<Self>,
    key_map: LeafKeyMap<V>,
}

// SAFETY: every field is atomic, and the key map is only mutated under the
// node's write lock. Values are plain `SlotValue` copies.
unsafe impl<V: SlotValue> Send for LeafNode<V> {}
// SAFETY: see above.
unsafe impl<V: SlotValue> Sync for LeafNode<V> {}

impl<V: SlotValue> LeafNode<V> {
    /// A new empty, unlinked leaf.
    #[must_use]
    pub fn new() -> Box<Self> {
        Box::new(Self {
            header: NodeHeader::new(0),
            prev: AtomicPtr::new(StdPtr::null_mut()),
            next: AtomicPtr::new(StdPtr::null_mut()),
            key_map: KeyMap::new(),
        })
    }

    /// Leak the box into a type-erased node pointer.
    #[must_use]
    pub fn into_ptr(self: Box<Self>) -> NodePtr {
        Box::into_raw(self).cast::<NodeHeader>()
    }

    // ========================================================================
    //  Accessors
    // ========================================================================

    /// The shared header.
    #[inline]
    #[must_use]
    pub const fn header(&self) -> &NodeHeader {
        &self.header
    }

    /// The node's version word.
    #[inline]
    #[must_use]
    pub const fn version(&self) -> &NodeVersion {
        self.header.version()
    }

    /// Left neighbour, or null.
    #[inline]
    #[must_use]
    pub fn prev(&self) -> *mut Self {
        self.prev.load(READ_ORD)
    }

    /// Right neighbour, or null.
    #[inline]
    #[must_use]
    pub fn next(&self) -> *mut Self {
        self.next.load(READ_ORD)
    }

    /// Optimistic view of the entries.
    ///
    /// May be torn if a writer is active. Validate the version before
    /// trusting anything read through it.
    #[inline]
    #[must_use]
    pub const fn key_map(&self) -> &LeafKeyMap<V> {
        &self.key_map
    }

    /// The entries, for mutation under `guard`.
    #[inline]
    fn locked_map(&self, guard: &WriteGuard<'_>) -> &LeafKeyMap<V> {
        debug_assert_eq!(guard.locked_value(), self.version().value());
        &self.key_map
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.key_map().len()
    }

    /// True when the leaf holds no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key_map().is_empty()
    }

    /// True if `key_len` more key bytes and a value still fit.
    #[inline]
    #[must_use]
    pub fn has_space(&self, key_len: usize) -> bool {
        self.key_map().enough_space(key_len)
    }

    /// Value stored under `key`.
    #[inline]
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<V> {
        self.key_map().get(key)
    }

    // ========================================================================
    //  Mutation (write lock held)
    // ========================================================================

    /// Insert `key -> value` in order. The caller has checked for duplicates.
    ///
    /// # Panics
    /// If the leaf lacks space for `key`.
    pub fn insert(&self, guard: &WriteGuard<'_>, key: &[u8], value: V) {
        let map: &LeafKeyMap<V> = self.locked_map(guard);
        let index: usize = map.find_lower(key);

        debug_assert_ne!(
            map.compare_at(index, key),
            Some(CmpOrdering::Equal),
            "duplicate key in leaf insert"
        );
        map.insert_key_value(index, key, value);
    }

    /// Move the upper half into a new right sibling and link it in.
    ///
    /// Returns the sibling and a copy of its first key, which becomes the
    /// separator in the parent.
    #[must_use]
    pub fn split(&self, guard: &WriteGuard<'_>) -> (Box<Self>, Vec<u8>) {
        let sibling: Box<Self> = Self::new();

        self.locked_map(guard).split(&sibling.key_map);
        let separator: Vec<u8> = sibling.key_map.key_at(0).unwrap_or_default();

        let sibling_ptr: *mut Self = StdPtr::from_ref(&*sibling).cast_mut();
        let old_next: *mut Self = self.next();

        sibling.prev.store(StdPtr::from_ref(self).cast_mut(), WRITE_ORD);
        sibling.next.store(old_next, WRITE_ORD);
        if !old_next.is_null() {
            // SAFETY: neighbours stay allocated for the tree's lifetime.
            unsafe { (*old_next).prev.store(sibling_ptr, WRITE_ORD) };
        }
        self.next.store(sibling_ptr, WRITE_ORD);

        (sibling, separator)
    }
}

impl<V: SlotValue> StdFmt::Debug for LeafNode<V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("LeafNode")
            .field("header", &self.header)
            .field("len", &self.len())
            .field("prev", &self.prev())
            .field("next", &self.next())
            .finish_non_exhaustive()
    }
}
