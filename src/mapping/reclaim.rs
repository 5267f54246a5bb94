//! Chain reclaimers for seize-based deferred reclamation.
//!
//! A retired chain is freed as a unit: the reclaimer walks `next` from the
//! head and drops every record. A `MergeDelta` borrows the head of another
//! chain, so the walk carries a visited set keyed on pointer addresses and
//! descends into borrowed chains at most once.

use std::collections::HashSet;

use seize::Collector;

use crate::node::{Node, NodeVariant};

/// Free every record reachable from `head`, each exactly once.
///
/// # Safety
///
/// - Every non-null pointer reached must have come from `Box::into_raw`.
/// - No concurrent reader may still observe any part of the chain.
pub(crate) unsafe fn free_chain<K, V>(head: *mut Node<K, V>, visited: &mut HashSet<usize>) {
    let mut cur: *mut Node<K, V> = head;

    while !cur.is_null() {
        // Address used for identity only, never turned back into a pointer.
        if !visited.insert(cur.addr()) {
            break;
        }

        // SAFETY: caller guarantees validity; visited-set insert above
        // guarantees this record has not been freed yet.
        let node: &Node<K, V> = unsafe { &*cur };
        let next: *mut Node<K, V> = node.next;

        if let NodeVariant::Merge(merge) = &node.variant {
            let original: *mut Node<K, V> = merge.original;
            // SAFETY: the merged-away chain is owned by this chain once the
            // merge delta is the only path to it; the shared visited set
            // keeps a doubly-reachable chain from being freed twice.
            unsafe { free_chain(original, visited) };
        }

        // SAFETY: cur was produced by Box::into_raw and is unreachable.
        unsafe { drop(Box::from_raw(cur)) };
        cur = next;
    }
}

/// Seize callback retiring one chain (the `guard.defer_retire` signature).
///
/// # Safety
///
/// - `head` must be a chain head produced by `Box::into_raw` that has been
///   unlinked from its mapping-table slot.
/// - Must only run once seize has determined no reader remains.
pub(crate) unsafe fn reclaim_chain<K, V>(head: *mut Node<K, V>, _collector: &Collector) {
    let mut visited: HashSet<usize> = HashSet::new();
    // SAFETY: forwarded from the caller's contract.
    unsafe { free_chain(head, &mut visited) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{KeyBound, RecordKind, NULL_PID};

    #[test]
    fn free_single_base() {
        let base: Node<u64, u64> =
            Node::base_leaf(vec![1], vec![vec![10]], NULL_PID, KeyBound::Infinite, KeyBound::Infinite);
        let ptr = Box::into_raw(Box::new(base));

        let mut visited = HashSet::new();
        // SAFETY: ptr was just created from Box::into_raw and is unshared.
        unsafe { free_chain(ptr, &mut visited) };
        assert_eq!(visited.len(), 1);
    }

    #[test]
    fn free_chain_of_deltas() {
        let base: Node<u64, u64> =
            Node::base_leaf(vec![], vec![], NULL_PID, KeyBound::Infinite, KeyBound::Infinite);
        let base_ptr = Box::into_raw(Box::new(base));

        // SAFETY: base_ptr is valid and unshared.
        let head = {
            let base_ref = unsafe { &*base_ptr };
            let d1 = Node::record_delta(RecordKind::Insert, 1, 10, base_ref, base_ptr, 1);
            let d1_ptr = Box::into_raw(Box::new(d1));
            let d1_ref = unsafe { &*d1_ptr };
            let d2 = Node::record_delta(RecordKind::Insert, 2, 20, d1_ref, d1_ptr, 2);
            Box::into_raw(Box::new(d2))
        };

        let mut visited = HashSet::new();
        // SAFETY: the whole chain is unshared.
        unsafe { free_chain(head, &mut visited) };
        assert_eq!(visited.len(), 3);
    }

    #[test]
    fn free_null_is_noop() {
        let mut visited = HashSet::new();
        // SAFETY: null is handled before any dereference.
        unsafe { free_chain::<u64, u64>(std::ptr::null_mut(), &mut visited) };
        assert!(visited.is_empty());
    }
}
