//! Filepath: src/node.rs
//!
//! Common node header and type-erased node pointers.
//!
//! Both node kinds are `#[repr(C)]` with [`NodeHeader`] as their first field,
//! so a `*mut InnerNode` or `*mut LeafNode<V>` can be viewed as a
//! `*mut NodeHeader`. The `level` field (0 for leaves) tells which one it is.

use std::fmt as StdFmt;

use crate::internode::InnerNode;
use crate::keymap::SlotValue;
use crate::leaf::LeafNode;
use crate::nodeversion::NodeVersion;

/// Type-erased pointer to any tree node.
pub type NodePtr = *mut NodeHeader;

/// Header shared by inner and leaf nodes.
#[repr(C)]
pub struct NodeHeader {
    version: NodeVersion,
    level: u16,
}

impl NodeHeader {
    pub(crate) const fn new(level: u16) -> Self {
        Self {
            version: NodeVersion::new(),
            level,
        }
    }

    /// The node's OLC version word.
    #[inline]
    #[must_use]
    pub const fn version(&self) -> &NodeVersion {
        &self.version
    }

    /// Distance from the leaf level. Leaves are level 0.
    #[inline]
    #[must_use]
    pub const fn level(&self) -> u16 {
        self.level
    }

    /// True for leaf nodes.
    #[inline]
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

impl StdFmt::Debug for NodeHeader {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("NodeHeader")
            .field("version", &self.version.value())
            .field("level", &self.level)
            .finish()
    }
}

/// A node pointer resolved to its concrete kind.
pub enum NodeRef<'a, V: SlotValue> {
    /// Level > 0.
    Inner(&'a InnerNode),

    /// Level 0.
    Leaf(&'a LeafNode<V>),
}

impl<'a, V: SlotValue> NodeRef<'a, V> {
    /// Resolve `ptr` by its level.
    ///
    /// # Safety
    /// `ptr` must point to a live node of a tree storing `V`, and the node
    /// must stay allocated for `'a`.
    #[inline]
    pub unsafe fn from_ptr(ptr: NodePtr) -> Self {
        // SAFETY: caller guarantees `ptr` is a live node. The header is the
        // first field of both node kinds.
        unsafe {
            if (*ptr).is_leaf() {
                Self::Leaf(&*ptr.cast::<LeafNode<V>>())
            } else {
                Self::Inner(&*ptr.cast::<InnerNode>())
            }
        }
    }

    /// The shared header.
    #[inline]
    #[must_use]
    pub const fn header(&self) -> &'a NodeHeader {
        match self {
            Self::Inner(inner) => inner.header(),
            Self::Leaf(leaf) => leaf.header(),
        }
    }
}

/// Free a node allocated by [`InnerNode::into_ptr`] or [`LeafNode::into_ptr`].
///
/// # Safety
/// `ptr` must be uniquely owned, of a tree storing `V`, and never used again.
pub(crate) unsafe fn free_node<V: SlotValue>(ptr: NodePtr) {
    // SAFETY: caller guarantees unique ownership. `from_ptr` recovers the
    // concrete type the node was boxed as.
    unsafe {
        if (*ptr).is_leaf() {
            drop(Box::from_raw(ptr.cast::<LeafNode<V>>()));
        } else {
            drop(Box::from_raw(ptr.cast::<InnerNode>()));
        }
    }
}
