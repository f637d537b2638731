//! Filepath: src/tree.rs
//!
//! Concurrent B+tree with optimistic lock coupling.
//!
//! Readers never write shared memory: they descend with version snapshots and
//! validate them hand over hand. Writers upgrade snapshots to write locks only
//! on the nodes they modify. Any failed validation restarts the operation from
//! the root.
//!
//! # Protocol
//!
//! ```text
//! 1. guard = reclaimer.join()
//! 2. v = root.read_lock_or_restart(); root pointer must still be `root`
//! 3. inner: child = find_child(); check(v); vc = child.read_lock(); check parent
//! 4. leaf:  search; read_unlock(v)
//! 5. any failure -> Restart -> goto 2
//! ```
//!
//! Inserts split full nodes on the way down (inner nodes are kept with room
//! for one more [`MAX_KEY_SIZE`] separator), so a split never has to
//! propagate upward. After a split the insert restarts.

use std::collections::VecDeque;
use std::fmt as StdFmt;
use std::fmt::Write as _;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};

use crate::config::MAX_KEY_SIZE;
use crate::epoch::Reclaimer;
use crate::keymap::SlotValue;
use crate::leaf::LeafNode;
use crate::node::{NodePtr, NodeRef, free_node};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

mod locked;
mod optimistic;

// ============================================================================
//  InsertError
// ============================================================================

/// Errors returned by [`BPlusTree::insert_unique`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError<V> {
    /// The key is already present. Carries the existing value.
    Duplicate(V),

    /// The key is longer than [`MAX_KEY_SIZE`].
    KeyTooLarge {
        /// Length of the rejected key.
        len: usize,

        /// Maximum accepted length.
        max: usize,
    },
}

impl<V> StdFmt::Display for InsertError<V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::Duplicate(_) => write!(f, "key already exists"),

            Self::KeyTooLarge { len, max } => {
                write!(f, "key of {len} bytes exceeds the {max} byte limit")
            }
        }
    }
}

impl<V: StdFmt::Debug> std::error::Error for InsertError<V> {}

// ============================================================================
//  Statistics
// ============================================================================

/// Snapshot of a tree's event counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Optimistic attempts abandoned and retried from the root.
    pub restarts: u64,

    /// Leaf nodes split.
    pub leaf_splits: u64,

    /// Inner nodes split.
    pub inner_splits: u64,

    /// Splits that installed a new root.
    pub root_splits: u64,
}

#[derive(Debug, Default)]
struct TreeCounters {
    restarts: AtomicU64,
    leaf_splits: AtomicU64,
    inner_splits: AtomicU64,
    root_splits: AtomicU64,
}

impl TreeCounters {
    fn snapshot(&self) -> TreeStats {
        TreeStats {
            restarts: self.restarts.load(RELAXED),
            leaf_splits: self.leaf_splits.load(RELAXED),
            inner_splits: self.inner_splits.load(RELAXED),
            root_splits: self.root_splits.load(RELAXED),
        }
    }
}

// ============================================================================
//  BPlusTree
// ============================================================================

/// Ordered map from byte-string keys to `V`, safe for concurrent lookups and
/// unique inserts.
///
/// Keys are at most [`MAX_KEY_SIZE`] bytes. Nodes are never merged or freed
/// while the tree is alive.
///
/// ```rust
/// use olckv::BPlusTree;
/// use olckv::epoch::EpochManager;
///
/// let epochs = EpochManager::manual();
/// let tree: BPlusTree<u64> = BPlusTree::new(epochs.reclaimer());
///
/// tree.insert_unique(b"hello", 1).unwrap();
/// assert_eq!(tree.lookup(b"hello"), Some(1));
/// assert!(tree.insert_unique(b"hello", 2).is_err());
/// ```
pub struct BPlusTree<V: SlotValue> {
    root: AtomicPtr<crate::node::NodeHeader>,
    reclaimer: Reclaimer,
    len: AtomicUsize,
    counters: TreeCounters,
    _marker: PhantomData<V>,
}

// SAFETY: nodes are shared through atomics and mutated only under their
// version locks. Values are `Copy` and moved between threads by value.
unsafe impl<V: SlotValue + Send> Send for BPlusTree<V> {}
// SAFETY: see above.
unsafe impl<V: SlotValue + Send + Sync> Sync for BPlusTree<V> {}

impl<V: SlotValue> BPlusTree<V> {
    /// An empty tree: a single empty leaf as root.
    #[must_use]
    pub fn new(reclaimer: Reclaimer) -> Self {
        Self {
            root: AtomicPtr::new(LeafNode::<V>::new().into_ptr()),
            reclaimer,
            len: AtomicUsize::new(0),
            counters: TreeCounters::default(),
            _marker: PhantomData,
        }
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(RELAXED)
    }

    /// True when the tree holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels, 1 for a lone leaf.
    #[must_use]
    pub fn height(&self) -> usize {
        let root: NodePtr = self.root.load(READ_ORD);

        // SAFETY: nodes stay allocated for the tree's lifetime; `level` is
        // immutable after construction.
        usize::from(unsafe { (*root).level() }) + 1
    }

    /// Event counters.
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        self.counters.snapshot()
    }

    #[inline]
    fn note_restart(&self) {
        self.counters.restarts.fetch_add(1, RELAXED);
    }

    // ========================================================================
    //  Exclusive Access
    // ========================================================================

    /// All nodes, breadth first from the root.
    fn collect_nodes(&mut self) -> Vec<NodePtr> {
        let mut nodes: Vec<NodePtr> = Vec::new();
        let mut queue: VecDeque<NodePtr> = VecDeque::from([*self.root.get_mut()]);

        while let Some(ptr) = queue.pop_front() {
            nodes.push(ptr);

            // SAFETY: `&mut self` excludes concurrent writers; every reachable
            // node is live.
            if let NodeRef::Inner(inner) = unsafe { NodeRef::<V>::from_ptr(ptr) } {
                queue.extend(inner.children());
            }
        }

        nodes
    }

    /// Render the tree in Graphviz dot format.
    pub fn to_dot(&mut self) -> String {
        let mut out: String = String::from("digraph bplustree {\n  node [shape=record];\n");

        for ptr in self.collect_nodes() {
            // SAFETY: exclusive access, all collected nodes are live.
            match unsafe { NodeRef::<V>::from_ptr(ptr) } {
                NodeRef::Inner(inner) => {
                    let keys: Vec<String> = inner
                        .key_map()
                        .iter()
                        .map(|(k, _)| escape_label(&k))
                        .collect();
                    let _ = writeln!(
                        out,
                        "  \"{ptr:p}\" [label=\"L{}|{}\"];",
                        inner.level(),
                        keys.join("|")
                    );
                    for child in inner.children() {
                        let _ = writeln!(out, "  \"{ptr:p}\" -> \"{child:p}\";");
                    }
                }
                NodeRef::Leaf(leaf) => {
                    let keys: Vec<String> = leaf
                        .key_map()
                        .iter()
                        .map(|(k, _)| escape_label(&k))
                        .collect();
                    let _ = writeln!(out, "  \"{ptr:p}\" [label=\"{}\"];", keys.join("|"));
                    let next = leaf.next();
                    if !next.is_null() {
                        let _ = writeln!(out, "  \"{ptr:p}\" -> \"{next:p}\" [style=dashed];");
                    }
                }
            }
        }

        out.push_str("}\n");
        out
    }

    /// Remove every entry and return the values in key order.
    ///
    /// All nodes are freed and the tree is reset to a single empty leaf.
    pub fn drain_values(&mut self) -> Vec<V> {
        let nodes: Vec<NodePtr> = self.collect_nodes();
        let mut values: Vec<V> = Vec::with_capacity(self.len());

        // Leaves appear left to right at the end of the breadth-first order.
        for &ptr in &nodes {
            // SAFETY: exclusive access, all collected nodes are live.
            if let NodeRef::Leaf(leaf) = unsafe { NodeRef::<V>::from_ptr(ptr) } {
                values.extend(leaf.key_map().iter().map(|(_, v)| v));
            }
        }

        for ptr in nodes {
            // SAFETY: each node is freed once and nothing references it after.
            unsafe { free_node::<V>(ptr) };
        }

        *self.root.get_mut() = LeafNode::<V>::new().into_ptr();
        *self.len.get_mut() = 0;
        values
    }
}

impl<V: SlotValue> Drop for BPlusTree<V> {
    fn drop(&mut self) {
        for ptr in self.collect_nodes() {
            // SAFETY: the tree is being dropped, so nothing else can reach its
            // nodes. Each node is freed once.
            unsafe { free_node::<V>(ptr) };
        }
        self.root.store(std::ptr::null_mut(), WRITE_ORD);
    }
}

impl<V: SlotValue> StdFmt::Debug for BPlusTree<V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("BPlusTree")
            .field("len", &self.len())
            .field("height", &self.height())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn escape_label(key: &[u8]) -> String {
    String::from_utf8_lossy(key)
        .chars()
        .flat_map(|c| match c {
            '"' | '|' | '{' | '}' | '<' | '>' | '\\' => vec!['\\', c],
            c if c.is_control() => vec!['?'],
            c => vec![c],
        })
        .collect()
}

/// Key length check shared by the insert path and its callers.
#[inline]
pub(crate) fn check_key_len<V>(key: &[u8]) -> Result<(), InsertError<V>> {
    if key.len() > MAX_KEY_SIZE {
        Err(InsertError::KeyTooLarge {
            len: key.len(),
            max: MAX_KEY_SIZE,
        })
    } else {
        Ok(())
    }
}
