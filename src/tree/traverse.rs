//! Root-to-leaf traversal.
//!
//! `search` walks from a starting PID to the leaf chain responsible for a
//! key and returns the PID path it actually dereferenced, root at the
//! bottom and target leaf on top. The path is what later steps use to
//! re-anchor after a structural change.
//!
//! Traversal never blocks and never retries by itself: it observes whatever
//! linearization of installs is currently visible. A null mapping-table
//! lookup means a racing structural change; the caller restarts the whole
//! operation from the root.

use seize::LocalGuard;

use crate::node::{Node, NodeVariant, Pid, NULL_PID};
use crate::tracing_helpers::warn_log;

use super::BwTree;

impl<K, V, L, E, Q> BwTree<K, V, L, E, Q>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Fn(&K, &K) -> bool,
    E: Fn(&K, &K) -> bool,
    Q: Fn(&V, &V) -> bool,
{
    /// Walk from `start` down to the leaf chain covering `key`.
    ///
    /// Returns `None` when a mapping-table slot on the way resolved to
    /// null (a racing retire); the operation restarts from the root.
    pub(super) fn search(
        &self,
        start: Pid,
        key: &K,
        guard: &LocalGuard<'_>,
    ) -> Option<Vec<Pid>> {
        let mut path: Vec<Pid> = Vec::new();

        let mut cur: *mut Node<K, V> = self.mapping.get(start, guard);
        if cur.is_null() {
            warn_log!(pid = start, "search start resolved to null");
            return None;
        }
        path.push(start);

        loop {
            // SAFETY: cur came from the mapping table under `guard`, or
            // from a chain-next pointer of such a node.
            let node: &Node<K, V> = unsafe { &*cur };

            match &node.variant {
                // The chain we are on is the target leaf.
                NodeVariant::Leaf(_) | NodeVariant::Record(_) => return Some(path),

                NodeVariant::Inner(inner) => {
                    // First separator greater than the key decides the
                    // child; past the last separator, the rightmost child.
                    let idx = inner
                        .keys
                        .iter()
                        .position(|sep| self.key_lt(key, sep))
                        .unwrap_or(inner.keys.len());
                    let child: Pid = inner.children[idx];
                    if child == NULL_PID {
                        warn_log!(pid = node.pid, idx, "inner child slot holds no pid");
                        return None;
                    }

                    cur = self.mapping.get(child, guard);
                    if cur.is_null() {
                        warn_log!(pid = child, "inner child resolved to null");
                        return None;
                    }
                    path.push(child);
                }

                NodeVariant::Split(split) => {
                    if self.key_ge(key, &split.pivot) {
                        // The upper half moved; this chain no longer covers
                        // the key. Swap the path top for the sibling.
                        cur = self.mapping.get(split.right, guard);
                        if cur.is_null() {
                            warn_log!(pid = split.right, "split sibling resolved to null");
                            return None;
                        }
                        path.pop();
                        path.push(split.right);
                    } else {
                        cur = self.chain_next(node);
                    }
                }

                NodeVariant::IndexEntry(entry) => {
                    if self.key_ge(key, &entry.low) && self.below_high(key, &entry.high) {
                        // Shortcut straight into the announced child.
                        cur = self.mapping.get(entry.right, guard);
                        if cur.is_null() {
                            warn_log!(pid = entry.right, "index entry child resolved to null");
                            return None;
                        }
                        path.push(entry.right);
                    } else {
                        cur = self.chain_next(node);
                    }
                }

                NodeVariant::Merge(merge) => {
                    if self.key_ge(key, &merge.pivot) {
                        // Keys past the pivot live on the merged-away chain.
                        cur = merge.original;
                        if cur.is_null() {
                            warn_log!(pid = node.pid, "merge delta holds no chain");
                            return None;
                        }
                    } else {
                        cur = self.chain_next(node);
                    }
                }

                NodeVariant::Remove => {
                    // The node is going away; back up one level and let its
                    // parent-level dispatch route the key again.
                    path.pop();
                    let Some(&parent) = path.last() else {
                        return None;
                    };
                    cur = self.mapping.get(parent, guard);
                    if cur.is_null() {
                        warn_log!(pid = parent, "parent resolved to null after remove");
                        return None;
                    }
                }

                // Never installed; skip past if one ever shows up.
                NodeVariant::DeleteIndex(_) => cur = self.chain_next(node),
            }
        }
    }

    /// Step down a delta chain; a delta with no successor is a broken chain.
    fn chain_next(&self, node: &Node<K, V>) -> *mut Node<K, V> {
        let next = node.next;
        assert!(
            !next.is_null(),
            "delta {} on pid {} has no chain successor",
            node.variant_name(),
            node.pid
        );
        next
    }
}
