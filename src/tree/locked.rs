//! Unique insert for [`BPlusTree`].
//!
//! # Write Protocol
//!
//! ```text
//! 1. guard = reclaimer.join()
//! 2. Descend optimistically (as lookup), coupling parent and child versions
//! 3. Inner node without room for a MAX_KEY_SIZE separator -> split, restart
//! 4. Leaf: key present -> Duplicate(existing), no mutation
//! 5. Leaf without room -> split, restart
//! 6. Leaf with room: upgrade leaf, validate parent, insert
//! ```
//!
//! # Split
//!
//! ```text
//! 1. upgrade parent (if any), then node
//! 2. no parent -> node must still be the root
//! 3. split node: upper half into a new sibling, separator returned
//! 4. insert separator into parent, or install a new root above node
//! 5. unlock node, then parent
//! ```

use crate::config::MAX_KEY_SIZE;
use crate::internode::InnerNode;
use crate::keymap::SlotValue;
use crate::node::{NodePtr, NodeRef};
use crate::nodeversion::{OlcResult, Restart, WriteGuard};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::tracing_helpers::{debug_log, trace_log, warn_log};

use super::{BPlusTree, InsertError, check_key_len};

/// Restarts within one insert before a warning is logged.
const RESTART_WARN_THRESHOLD: usize = 1_000;

/// Outcome of one successful descent.
enum InsertOutcome<V> {
    Inserted,
    Duplicate(V),
}

impl<V: SlotValue> BPlusTree<V> {
    /// Insert `key -> value` if `key` is absent.
    ///
    /// # Errors
    /// - [`InsertError::Duplicate`] with the existing value if `key` is
    ///   present. The tree is not modified.
    /// - [`InsertError::KeyTooLarge`] if `key` exceeds [`MAX_KEY_SIZE`].
    pub fn insert_unique(&self, key: &[u8], value: V) -> Result<(), InsertError<V>> {
        check_key_len(key)?;
        let _guard = self.reclaimer.join();
        let mut restarts: usize = 0;

        loop {
            match self.try_insert(key, value) {
                Ok(InsertOutcome::Inserted) => {
                    self.len.fetch_add(1, RELAXED);
                    return Ok(());
                }
                Ok(InsertOutcome::Duplicate(existing)) => {
                    return Err(InsertError::Duplicate(existing));
                }
                Err(Restart) => {
                    self.note_restart();
                    restarts += 1;
                    trace_log!(key_len = key.len(), "insert restart");
                    if restarts == RESTART_WARN_THRESHOLD {
                        warn_log!(restarts, key_len = key.len(), "insert starving under contention");
                    }
                }
            }
        }
    }

    /// One optimistic descent. Any split ends the attempt with `Restart`.
    fn try_insert(&self, key: &[u8], value: V) -> OlcResult<InsertOutcome<V>> {
        let mut node: NodePtr = self.root.load(READ_ORD);
        // SAFETY: nodes stay allocated for the tree's lifetime.
        let mut version: u64 = unsafe { (*node).version() }.read_lock_or_restart()?;

        if self.root.load(READ_ORD) != node {
            return Err(Restart);
        }

        let mut parent: Option<(&InnerNode, u64)> = None;

        loop {
            // SAFETY: `node` was reached through validated pointers.
            match unsafe { NodeRef::<V>::from_ptr(node) } {
                NodeRef::Inner(inner) => {
                    if !inner.has_space(MAX_KEY_SIZE) {
                        self.split_node(node, version, parent)?;
                        return Err(Restart);
                    }

                    if let Some((p, parent_version)) = parent {
                        p.version().read_unlock_or_restart(parent_version)?;
                    }

                    let child: NodePtr = inner.find_child(key);
                    inner.version().check_or_restart(version)?;
                    if child.is_null() {
                        return Err(Restart);
                    }

                    // SAFETY: validated child pointer of a live node.
                    let child_version: u64 =
                        unsafe { (*child).version() }.read_lock_or_restart()?;

                    parent = Some((inner, version));
                    node = child;
                    version = child_version;
                }

                NodeRef::Leaf(leaf) => {
                    if let Some(existing) = leaf.lookup(key) {
                        leaf.version().check_or_restart(version)?;
                        return Ok(InsertOutcome::Duplicate(existing));
                    }

                    if !leaf.has_space(key.len()) {
                        self.split_node(node, version, parent)?;
                        return Err(Restart);
                    }

                    let guard: WriteGuard<'_> =
                        leaf.version().upgrade_to_write_lock_or_restart(version)?;
                    if let Some((p, parent_version)) = parent {
                        // On failure `guard` drops and unlocks the leaf.
                        p.version().read_unlock_or_restart(parent_version)?;
                    }

                    leaf.insert(&guard, key, value);
                    guard.write_unlock();
                    return Ok(InsertOutcome::Inserted);
                }
            }
        }
    }

    /// Split `node` (read at `version`) below `parent`.
    ///
    /// `parent` was checked to have room for one more separator when it was
    /// read at its version, and the upgrade below fails if it changed since.
    fn split_node(
        &self,
        node: NodePtr,
        version: u64,
        parent: Option<(&InnerNode, u64)>,
    ) -> OlcResult<()> {
        let parent_guard: Option<(&InnerNode, WriteGuard<'_>)> = match parent {
            Some((p, parent_version)) => {
                Some((p, p.version().upgrade_to_write_lock_or_restart(parent_version)?))
            }
            None => None,
        };

        // SAFETY: `node` is live; its header is shared by both node kinds.
        let node_guard: WriteGuard<'_> =
            unsafe { (*node).version() }.upgrade_to_write_lock_or_restart(version)?;

        if parent_guard.is_none() && self.root.load(READ_ORD) != node {
            return Err(Restart);
        }

        // SAFETY: write-locked live node.
        let (sibling, separator, level): (NodePtr, Vec<u8>, u16) =
            match unsafe { NodeRef::<V>::from_ptr(node) } {
                NodeRef::Inner(inner) => {
                    let (sibling, separator) = inner.split(&node_guard);
                    self.counters.inner_splits.fetch_add(1, RELAXED);
                    (sibling.into_ptr(), separator, inner.level())
                }
                NodeRef::Leaf(leaf) => {
                    let (sibling, separator) = leaf.split(&node_guard);
                    self.counters.leaf_splits.fetch_add(1, RELAXED);
                    (sibling.into_ptr(), separator, 0)
                }
            };

        match &parent_guard {
            Some((p, guard)) => {
                p.insert(guard, &separator, sibling);
                debug_log!(level, separator_len = separator.len(), "node split");
            }
            None => {
                let root: NodePtr = InnerNode::new_root(level + 1, node, sibling, &separator).into_ptr();
                self.root.store(root, WRITE_ORD);
                self.counters.root_splits.fetch_add(1, RELAXED);
                debug_log!(height = level + 2, "root split");
            }
        }

        node_guard.write_unlock();
        drop(parent_guard);
        Ok(())
    }
}
