//! Split protocol.
//!
//! A split of node `P` is a short sequence of CAS-published steps:
//!
//! ```text
//! 1. Fold P's chain and build sibling Q from the upper half; install Q
//!    under a fresh PID (private until step 2 wins).
//! 2. CAS a SplitDelta(pivot, Q) onto P. On failure, clear Q's slot,
//!    retire Q, and retry the round against the new head.
//! 3. Remember which side of the pivot the driving key fell on.
//! 4. Consolidate P to cap its chain.
//! 5. If P was the root, hoist a fresh inner root over P and Q and swing
//!    the root handle until the CAS sticks.
//! 6. Otherwise CAS an IndexEntryDelta announcing Q onto the parent,
//!    re-anchoring the path if the parent itself moved.
//! 7. If the parent is now over budget, continue the loop one level up.
//! ```
//!
//! A traversal that sees the SplitDelta but not yet the parent's index
//! entry still reaches the right leaf through the delta's redirect; step 6
//! only shortens future searches. It is still always driven to completion,
//! because routing through a stale parent keeps spinning until the entry
//! lands.

use seize::LocalGuard;

use crate::node::{KeyBound, Node, Pid};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS};
use crate::tracing_helpers::{debug_log, trace_log, warn_log};

use super::BwTree;

/// Sibling materialized from the upper half of an over-budget node.
struct SiblingSplit<K> {
    /// First key that moved; separator between the halves.
    pivot: K,

    /// PID of the sibling.
    right: Pid,

    /// Sibling's exclusive high bound (the split node's old one).
    right_high: KeyBound<K>,

    /// Slot count the original node keeps.
    retained: usize,
}

impl<K, V, L, E, Q> BwTree<K, V, L, E, Q>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Fn(&K, &K) -> bool,
    E: Fn(&K, &K) -> bool,
    Q: Fn(&V, &V) -> bool,
{
    /// Split every over-budget node on the path to `key`, bottom up.
    pub(super) fn split_if_needed(&self, key: &K, guard: &LocalGuard<'_>) {
        'restart: loop {
            let Some(mut path) = self.search(self.root_pid(), key, guard) else {
                continue;
            };
            let Some(mut cur_pid) = path.pop() else {
                continue;
            };
            let mut cur_head: *mut Node<K, V> = self.mapping.get(cur_pid, guard);
            if cur_head.is_null() {
                continue;
            }

            // Pids this split already routed through, leaf level first; used
            // to re-anchor the path when a parent moves underneath us.
            let mut visited: Vec<Pid> = Vec::new();

            loop {
                // SAFETY: cur_head protected by the guard.
                let head: &Node<K, V> = unsafe { &*cur_head };
                if !head.needs_split(&self.budget) {
                    return;
                }
                debug_log!(pid = cur_pid, slots = head.slot_use, "split round");

                // 1. Materialize the sibling.
                let sibling = if head.is_leaf {
                    self.build_leaf_sibling(cur_head)
                } else {
                    self.build_inner_sibling(cur_head)
                };

                // 2. Publish the split delta.
                let delta = Node::split_delta(
                    sibling.pivot.clone(),
                    sibling.right,
                    sibling.retained,
                    head,
                    cur_head,
                );
                let delta_ptr: *mut Node<K, V> = Box::into_raw(Box::new(delta));
                // SAFETY: delta_ptr is fresh and unshared until the CAS wins.
                if !unsafe { self.mapping.install(cur_pid, cur_head, delta_ptr) } {
                    trace_log!(pid = cur_pid, "split cas lost; rolling back sibling");

                    // The sibling PID never escaped this thread, so the
                    // rollback CAS cannot be contended.
                    let sibling_head = self.mapping.get(sibling.right, guard);
                    assert!(
                        self.mapping.clear(sibling.right, sibling_head),
                        "private sibling slot changed during rollback"
                    );
                    // SAFETY: sibling_head was just unlinked; no reader ever
                    // reached it through the unpublished delta.
                    unsafe { self.mapping.retire_chain(sibling_head, guard) };
                    // SAFETY: the delta was never published.
                    unsafe { drop(Box::from_raw(delta_ptr)) };

                    cur_head = self.mapping.get(cur_pid, guard);
                    if cur_head.is_null() {
                        continue 'restart;
                    }
                    continue;
                }

                // 3. Which half covers the driving key decides where the
                //    path re-anchors at this level.
                visited.push(if self.key_ge(key, &sibling.pivot) {
                    sibling.right
                } else {
                    cur_pid
                });

                // 4. The delta just pushed the chain over by one; cap it.
                let _ = self.consolidate(cur_pid, guard);

                // 5. Root split.
                if path.is_empty() {
                    self.install_new_root(cur_pid, sibling.right, sibling.pivot, guard);
                    return;
                }

                // 6. Announce the sibling to the parent.
                let parent_pid = self.install_parent_entry(key, &mut path, &visited, &sibling, guard);

                // 7. Continue upward while the parent is over budget.
                cur_pid = parent_pid;
                cur_head = self.mapping.get(cur_pid, guard);
                if cur_head.is_null() {
                    continue 'restart;
                }
                // SAFETY: protected by the guard.
                let parent: &Node<K, V> = unsafe { &*cur_head };
                if !parent.needs_split(&self.budget) {
                    let _ = self.consolidate(cur_pid, guard);
                    return;
                }
            }
        }
    }

    /// Build and install the leaf sibling holding the folded upper half.
    fn build_leaf_sibling(&self, head_ptr: *mut Node<K, V>) -> SiblingSplit<K> {
        // SAFETY: protected by the caller's guard.
        let head: &Node<K, V> = unsafe { &*head_ptr };

        let (mut keys, mut values) = self.fold_leaf(head_ptr);
        let n = keys.len();
        assert_eq!(n, head.slot_use, "folded leaf disagrees with head slot count");

        let mid = n / 2;
        debug_assert!(mid >= self.budget.min_leaf_slots);
        let pivot: K = keys[mid].clone();

        let right_keys = keys.split_off(mid);
        let right_values = values.split_off(mid);
        let sibling = Node::base_leaf(
            right_keys,
            right_values,
            head.next_leaf,
            KeyBound::Finite(pivot.clone()),
            head.high_key.clone(),
        );
        // SAFETY: the sibling is fresh and unshared.
        let right: Pid = unsafe { self.mapping.allocate(Box::into_raw(Box::new(sibling))) };
        debug_log!(pid = head.pid, sibling = right, moved = n - mid, "leaf sibling built");

        SiblingSplit {
            pivot,
            right,
            right_high: head.high_key.clone(),
            retained: mid,
        }
    }

    /// Build and install the inner sibling. The pivot key moves up to the
    /// parent; the sibling keeps the keys above it, with the child that
    /// covered `[pivot, keys[mid+1])` as its leftmost child.
    fn build_inner_sibling(&self, head_ptr: *mut Node<K, V>) -> SiblingSplit<K> {
        // SAFETY: protected by the caller's guard.
        let head: &Node<K, V> = unsafe { &*head_ptr };

        let (keys, children) = self.fold_inner(head_ptr);
        let n = keys.len();
        assert_eq!(n, head.slot_use, "folded inner disagrees with head slot count");

        let mid = n / 2;
        debug_assert!(mid >= self.budget.min_inner_slots);
        let pivot: K = keys[mid].clone();

        let right_keys: Vec<K> = keys[mid + 1..].to_vec();
        let right_children: Vec<Pid> = children[mid + 1..].to_vec();
        debug_assert_eq!(right_children.len(), right_keys.len() + 1);

        let sibling = Node::base_inner(
            right_keys,
            right_children,
            KeyBound::Finite(pivot.clone()),
            head.high_key.clone(),
        );
        // SAFETY: the sibling is fresh and unshared.
        let right: Pid = unsafe { self.mapping.allocate(Box::into_raw(Box::new(sibling))) };
        debug_log!(pid = head.pid, sibling = right, "inner sibling built");

        SiblingSplit {
            pivot,
            right,
            right_high: head.high_key.clone(),
            retained: mid,
        }
    }

    /// Hoist a fresh root over the two halves of a root split and swing the
    /// root handle. The CAS refreshes its expectation until it sticks.
    fn install_new_root(&self, left: Pid, right: Pid, pivot: K, _guard: &LocalGuard<'_>) {
        let root_node: Node<K, V> = Node::base_inner(
            vec![pivot],
            vec![left, right],
            KeyBound::Infinite,
            KeyBound::Infinite,
        );
        // SAFETY: the new root is fresh and unshared.
        let new_root: Pid = unsafe { self.mapping.allocate(Box::into_raw(Box::new(root_node))) };

        let mut expected: Pid = left;
        while let Err(observed) =
            self.root
                .compare_exchange(expected, new_root, CAS_SUCCESS, CAS_FAILURE)
        {
            warn_log!(expected, observed, new_root, "root swing raced; retrying");
            expected = observed;
        }
        debug_log!(root = new_root, left, right, "new root installed");
    }

    /// CAS the index entry for the new sibling onto the split node's parent,
    /// then pop the parent off the path and return its PID.
    ///
    /// Runs until it succeeds: the entry is what lets searches through this
    /// parent stop detouring over the split delta.
    fn install_parent_entry(
        &self,
        key: &K,
        path: &mut Vec<Pid>,
        visited: &[Pid],
        sibling: &SiblingSplit<K>,
        guard: &LocalGuard<'_>,
    ) -> Pid {
        loop {
            let (parent_pid, parent_ptr) = self.find_parent(key, path, visited, guard);
            // SAFETY: protected by the guard.
            let parent: &Node<K, V> = unsafe { &*parent_ptr };

            let delta = Node::index_entry_delta(
                sibling.pivot.clone(),
                sibling.right_high.clone(),
                sibling.right,
                parent,
                parent_ptr,
            );
            let delta_ptr: *mut Node<K, V> = Box::into_raw(Box::new(delta));
            // SAFETY: delta_ptr is fresh and unshared until the CAS wins.
            if unsafe { self.mapping.install(parent_pid, parent_ptr, delta_ptr) } {
                debug_log!(parent = parent_pid, child = sibling.right, "index entry installed");
                path.pop();
                return parent_pid;
            }

            // SAFETY: the CAS lost, so the delta was never published.
            unsafe { drop(Box::from_raw(delta_ptr)) };
            trace_log!(parent = parent_pid, "index entry cas lost; redo");
        }
    }

    /// Current parent of the node being split: the path top, as long as it
    /// is an inner chain whose range still covers `key`. When the parent
    /// moved, re-search from the root and unwind exactly the levels this
    /// split already handled (one path entry per completed round, leaf
    /// level upward), landing back on the parent level regardless of how
    /// concurrent splits reshaped those lower levels.
    fn find_parent(
        &self,
        key: &K,
        path: &mut Vec<Pid>,
        visited: &[Pid],
        guard: &LocalGuard<'_>,
    ) -> (Pid, *mut Node<K, V>) {
        loop {
            if let Some(&top) = path.last() {
                let head = self.mapping.get(top, guard);
                if !head.is_null() {
                    // SAFETY: protected by the guard.
                    let node: &Node<K, V> = unsafe { &*head };
                    if !node.is_leaf && self.key_in_range(key, node) {
                        return (top, head);
                    }
                }
                warn_log!(pid = top, "parent changed during split; re-anchoring");
            }

            let Some(mut fresh) = self.search(self.root_pid(), key, guard) else {
                continue;
            };
            // Every path entry is one level deeper than the previous, so
            // dropping one entry per handled level puts the parent on top.
            if fresh.len() <= visited.len() {
                continue;
            }
            fresh.truncate(fresh.len() - visited.len());
            *path = fresh;
        }
    }
}
