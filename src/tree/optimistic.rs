//! Optimistic lookup for [`BPlusTree`].
//!
//! Readers take no locks. Every node visited is read under a version
//! snapshot, and the snapshot is validated before the result (a child
//! pointer or a value) is used.

use crate::keymap::SlotValue;
use crate::node::{NodePtr, NodeRef};
use crate::nodeversion::{OlcResult, Restart};
use crate::ordering::READ_ORD;
use crate::tracing_helpers::trace_log;

use super::BPlusTree;

impl<V: SlotValue> BPlusTree<V> {
    /// Value stored under `key`.
    ///
    /// Retries until a consistent snapshot is observed.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<V> {
        let _guard = self.reclaimer.join();

        loop {
            match self.try_lookup(key) {
                Ok(found) => return found,
                Err(Restart) => {
                    self.note_restart();
                    trace_log!(key_len = key.len(), "lookup restart");
                }
            }
        }
    }

    /// One optimistic descent.
    fn try_lookup(&self, key: &[u8]) -> OlcResult<Option<V>> {
        let mut node: NodePtr = self.root.load(READ_ORD);
        // SAFETY: nodes stay allocated for the tree's lifetime.
        let mut version: u64 = unsafe { (*node).version() }.read_lock_or_restart()?;

        // A parentless node must still be the root.
        if self.root.load(READ_ORD) != node {
            return Err(Restart);
        }

        loop {
            // SAFETY: `node` was reached through validated pointers.
            match unsafe { NodeRef::<V>::from_ptr(node) } {
                NodeRef::Leaf(leaf) => {
                    let found: Option<V> = leaf.lookup(key);
                    leaf.version().read_unlock_or_restart(version)?;
                    return Ok(found);
                }

                NodeRef::Inner(inner) => {
                    let child: NodePtr = inner.find_child(key);
                    inner.version().check_or_restart(version)?;
                    if child.is_null() {
                        return Err(Restart);
                    }

                    // SAFETY: validated child pointer of a live node.
                    let child_version: u64 =
                        unsafe { (*child).version() }.read_lock_or_restart()?;
                    inner.version().read_unlock_or_restart(version)?;

                    node = child;
                    version = child_version;
                }
            }
        }
    }
}
