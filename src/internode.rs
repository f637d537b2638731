//! Filepath: src/internode.rs
//!
//! Inner (routing) node of the B+tree.
//!
//! Inner nodes hold separator keys and child pointers, no values. The
//! separators live in a [`KeyMap`] whose values are child pointers; the
//! leftmost child is stored separately.
//!
//! # B+Tree Routing Model
//!
//! ```text
//!              [K0 | K1 | K2]           <- InnerNode (3 keys, 4 children)
//!             /    |    |    \
//!   first_child   C0    C1    C2        <- Children
//!
//!   first_child: keys < K0
//!   C0: keys >= K0 and < K1
//!   C1: keys >= K1 and < K2
//!   C2: keys >= K2
//! ```
//!
//! # Thread Safety
//!
//! - **Readers:** read the version, read the node, validate the version.
//! - **Writers:** mutate only through a [`WriteGuard`] on this node's version.

use std::cmp::Ordering as CmpOrdering;
use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::AtomicPtr;

use crate::config::INNERNODE_SIZE;
use crate::keymap::KeyMap;
use crate::node::{NodeHeader, NodePtr};
use crate::nodeversion::{NodeVersion, WriteGuard};
use crate::ordering::{READ_ORD, WRITE_ORD};

/// Separator map of an inner node.
pub type InnerKeyMap = KeyMap<NodePtr, INNERNODE_SIZE>;

// ============================================================================
//  InnerNode
// ============================================================================

/// An internal routing node.
///
/// Child count is always separator count + 1.
#[repr(C)]
pub struct InnerNode {
    header: NodeHeader,
    first_child: AtomicPtr<NodeHeader>,
    key_map: InnerKeyMap,
}

// SAFETY: every field is atomic, and the key map is only mutated under the
// node's write lock. Readers copy child pointers out and validate the version
// before following them.
unsafe impl Send for InnerNode {}
// SAFETY: see above.
unsafe impl Sync for InnerNode {}

impl InnerNode {
    /// A new empty inner node at `level` (> 0).
    #[must_use]
    pub fn new(level: u16, first_child: NodePtr) -> Box<Self> {
        debug_assert!(level > 0, "inner nodes live above the leaf level");

        Box::new(Self {
            header: NodeHeader::new(level),
            first_child: AtomicPtr::new(first_child),
            key_map: KeyMap::new(),
        })
    }

    /// A new root routing `key` and above to `right`, the rest to `left`.
    #[must_use]
    pub fn new_root(level: u16, left: NodePtr, right: NodePtr, key: &[u8]) -> Box<Self> {
        let root: Box<Self> = Self::new(level, left);
        root.key_map.push(key, right);
        root
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

    /// Level of this node.
    #[inline]
    #[must_use]
    pub const fn level(&self) -> u16 {
        self.header.level()
    }

    /// Child holding keys below every separator.
    #[inline]
    #[must_use]
    pub fn first_child(&self) -> NodePtr {
        self.first_child.load(READ_ORD)
    }

    /// Optimistic view of the separators.
    ///
    /// May be torn if a writer is active. Validate the version before
    /// trusting anything read through it.
    #[inline]
    #[must_use]
    pub const fn key_map(&self) -> &InnerKeyMap {
        &self.key_map
    }

    /// The separators, for mutation under `guard`.
    #[inline]
    fn locked_map(&self, guard: &WriteGuard<'_>) -> &InnerKeyMap {
        debug_assert_eq!(guard.locked_value(), self.version().value());
        &self.key_map
    }

    /// Number of separators.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.key_map().len()
    }

    /// True when the node has no separators (a single child).
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key_map().is_empty()
    }

    /// True if a separator of `key_len` bytes still fits.
    #[inline]
    #[must_use]
    pub fn has_space(&self, key_len: usize) -> bool {
        self.key_map().enough_space(key_len)
    }

    // ========================================================================
    //  Routing
    // ========================================================================

    /// Child whose range covers `key`.
    ///
    /// Returns null on a torn read; the caller's version check will fail.
    #[must_use]
    pub fn find_child(&self, key: &[u8]) -> NodePtr {
        let map: &InnerKeyMap = self.key_map();
        let index: usize = map.find_lower(key);

        if map.compare_at(index, key) == Some(CmpOrdering::Equal) {
            return map.value_at(index).unwrap_or(StdPtr::null_mut());
        }

        match index.checked_sub(1) {
            None => self.first_child(),
            Some(prev) => map.value_at(prev).unwrap_or(StdPtr::null_mut()),
        }
    }

    /// Every child pointer, leftmost first.
    pub fn children(&self) -> impl Iterator<Item = NodePtr> + '_ {
        std::iter::once(self.first_child()).chain(self.key_map().iter().map(|(_, child)| child))
    }

    // ========================================================================
    //  Mutation (write lock held)
    // ========================================================================

    /// Add separator `key` routing to `child`.
    ///
    /// # Panics
    /// If the node lacks space for `key`.
    pub fn insert(&self, guard: &WriteGuard<'_>, key: &[u8], child: NodePtr) {
        let map: &InnerKeyMap = self.locked_map(guard);
        let index: usize = map.find_lower(key);

        map.insert_key_value(index, key, child);
    }

    /// Move the upper half into a new sibling at the same level.
    ///
    /// The last separator left after the split is popped: its child becomes
    /// the sibling's `first_child`, and its key is returned for promotion.
    #[must_use]
    pub fn split(&self, guard: &WriteGuard<'_>) -> (Box<Self>, Vec<u8>) {
        let sibling: Box<Self> = Self::new(self.level(), StdPtr::null_mut());

        let (promoted, child) = self.locked_map(guard).split_with_key(&sibling.key_map);
        sibling.first_child.store(child, WRITE_ORD);

        (sibling, promoted)
    }
}

impl StdFmt::Debug for InnerNode {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("InnerNode")
            .field("header", &self.header)
            .field("first_child", &self.first_child())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "fail fast in tests")]
mod tests {
    use super::*;

    fn fake(n: usize) -> NodePtr {
        // Distinct non-null pointers; never dereferenced.
        StdPtr::without_provenance_mut(n * 8)
    }

    fn filled(keys: &[&str]) -> Box<InnerNode> {
        let node: Box<InnerNode> = InnerNode::new(1, fake(1000));
        let guard = node.version().write_lock_or_restart().unwrap();
        for (i, key) in keys.iter().enumerate() {
            node.insert(&guard, key.as_bytes(), fake(i + 1));
        }
        drop(guard);
        node
    }

    #[test]
    fn test_routing() {
        let node = filled(&["20", "40", "60"]);

        assert_eq!(node.find_child(b"10"), fake(1000));
        assert_eq!(node.find_child(b"20"), fake(1));
        assert_eq!(node.find_child(b"30"), fake(1));
        assert_eq!(node.find_child(b"40"), fake(2));
        assert_eq!(node.find_child(b"59"), fake(2));
        assert_eq!(node.find_child(b"60"), fake(3));
        assert_eq!(node.find_child(b"99"), fake(3));
    }

    #[test]
    fn test_new_root() {
        let root = InnerNode::new_root(2, fake(1), fake(2), b"m");

        assert_eq!(root.level(), 2);
        assert_eq!(root.len(), 1);
        assert_eq!(root.find_child(b"a"), fake(1));
        assert_eq!(root.find_child(b"m"), fake(2));
        assert_eq!(root.find_child(b"z"), fake(2));
    }

    #[test]
    fn test_children_order() {
        let node = filled(&["b", "c"]);
        let children: Vec<NodePtr> = node.children().collect();

        assert_eq!(children, [fake(1000), fake(1), fake(2)]);
    }

    #[test]
    fn test_split_promotes_median() {
        let node = filled(&["2", "3", "4"]);
        let guard = node.version().write_lock_or_restart().unwrap();

        let (sibling, promoted) = node.split(&guard);
        drop(guard);

        assert_eq!(promoted, b"3");
        assert_eq!(node.len(), 1);
        assert_eq!(sibling.len(), 1);
        assert_eq!(sibling.level(), 1);
        // The popped separator's child leads the sibling.
        assert_eq!(sibling.first_child(), fake(2));
        assert_eq!(sibling.find_child(b"4"), fake(3));
        assert_eq!(node.find_child(b"2"), fake(1));
    }

    #[test]
    fn test_split_hundred() {
        let names: Vec<String> = (100..200).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let node = filled(&refs);
        let guard = node.version().write_lock_or_restart().unwrap();

        let (sibling, promoted) = node.split(&guard);
        drop(guard);

        assert_eq!(promoted, b"149");
        assert_eq!(node.len() + sibling.len(), 99);
        assert_eq!(node.len(), 49);
        assert_eq!(sibling.len(), 50);
    }

    #[test]
    fn test_split_bumps_version() {
        let node = filled(&["a", "b", "c"]);
        let before: u64 = node.version().read_lock_or_restart().unwrap();

        let guard = node.version().upgrade_to_write_lock_or_restart(before).unwrap();
        let _ = node.split(&guard);
        drop(guard);

        assert!(node.version().check_or_restart(before).is_err());
    }
}
