//! Chain consolidation.
//!
//! When a chain grows past the configured length, its logical content is
//! folded into one fresh base node and CAS-swapped in for the whole chain.
//! The replaced chain is retired through seize. Consolidation is
//! best-effort: a lost CAS just skips the round, and correctness never
//! depends on it happening.

use seize::LocalGuard;

use crate::node::{Node, Pid};
use crate::tracing_helpers::{debug_log, trace_log};

use super::BwTree;

impl<K, V, L, E, Q> BwTree<K, V, L, E, Q>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Fn(&K, &K) -> bool,
    E: Fn(&K, &K) -> bool,
    Q: Fn(&V, &V) -> bool,
{
    /// Consolidate the chain at `pid` if it is over the length threshold.
    ///
    /// Returns the current head afterwards, or `None` when the caller must
    /// restart: the slot resolved to null, or the head is over its slot
    /// budget and has to go through the split path first.
    pub(super) fn consolidate(
        &self,
        pid: Pid,
        guard: &LocalGuard<'_>,
    ) -> Option<*mut Node<K, V>> {
        let mut head_ptr: *mut Node<K, V> = self.mapping.get(pid, guard);

        loop {
            if head_ptr.is_null() {
                return None;
            }
            // SAFETY: protected by the guard.
            let head: &Node<K, V> = unsafe { &*head_ptr };

            if head.needs_split(&self.budget) {
                return None;
            }
            if head.delta_len <= self.config.delta_chain_max {
                return Some(head_ptr);
            }

            let candidate: Node<K, V> = if head.is_leaf {
                let (keys, values) = self.fold_leaf(head_ptr);
                assert!(
                    keys.len() <= self.budget.leaf_slot_max,
                    "folded leaf pid {pid} over budget: {} slots",
                    keys.len()
                );
                Node::base_leaf(
                    keys,
                    values,
                    head.next_leaf,
                    head.low_key.clone(),
                    head.high_key.clone(),
                )
            } else {
                let (keys, children) = self.fold_inner(head_ptr);
                assert!(
                    keys.len() <= self.budget.inner_slot_max,
                    "folded inner pid {pid} over budget: {} slots",
                    keys.len()
                );
                Node::base_inner(keys, children, head.low_key.clone(), head.high_key.clone())
            };

            let candidate_ptr: *mut Node<K, V> = Box::into_raw(Box::new(candidate));
            // SAFETY: candidate_ptr is fresh and unshared until the CAS wins.
            if unsafe { self.mapping.install(pid, head_ptr, candidate_ptr) } {
                debug_log!(pid, chain = head.delta_len, "chain consolidated");
                // SAFETY: the old chain was just unlinked by the CAS above.
                unsafe { self.mapping.retire_chain(head_ptr, guard) };
                return Some(candidate_ptr);
            }

            // Someone else got a delta (or their own consolidation) in
            // first; drop the candidate and re-evaluate.
            trace_log!(pid, "consolidate cas lost");
            // SAFETY: the candidate was never published.
            unsafe { drop(Box::from_raw(candidate_ptr)) };
            head_ptr = self.mapping.get(pid, guard);
        }
    }
}
