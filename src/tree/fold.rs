//! Chain folding and chain readers.
//!
//! Two access patterns share this module:
//!
//! - **Bottom-up folds** (`fold_leaf`, `fold_inner`) materialize the logical
//!   content of a chain by replaying its deltas in insertion order on top of
//!   the base. Consolidation, splits and scans are all built on these.
//! - **Top-down readers** (`collect_values`, `count_pair`, `key_is_in`)
//!   answer point queries in one pass from the head, carrying a *tombstone
//!   bag*: each delete delta seen on the way down cancels exactly one
//!   matching value seen further down. Values are opaque, so the bag is a
//!   plain vector probed with the supplied equality predicate.

use seize::LocalGuard;

use crate::node::{Node, NodeVariant, Pid, RecordKind};
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
    /// Remove one entry matching `value` from the bag; true if one was there.
    fn bag_take(&self, bag: &mut Vec<V>, value: &V) -> bool {
        if let Some(idx) = bag.iter().position(|t| self.value_equal(t, value)) {
            bag.swap_remove(idx);
            true
        } else {
            false
        }
    }

    /// All live values for `key`, restarting from the root whenever the walk
    /// runs into a retired node or a remove delta.
    pub(super) fn collect_values(&self, key: &K, guard: &LocalGuard<'_>) -> Vec<V> {
        'restart: loop {
            let Some(path) = self.search(self.root_pid(), key, guard) else {
                continue;
            };
            let Some(&leaf_pid) = path.last() else {
                continue;
            };
            let mut cur: *mut Node<K, V> = self.mapping.get(leaf_pid, guard);
            if cur.is_null() {
                continue;
            }

            let mut result: Vec<V> = Vec::new();
            let mut tombstones: Vec<V> = Vec::new();

            loop {
                // SAFETY: cur is protected by the guard.
                let node: &Node<K, V> = unsafe { &*cur };
                assert!(node.is_leaf, "point lookup walked onto an inner chain");

                match &node.variant {
                    NodeVariant::Record(record) if self.key_equal(&record.key, key) => {
                        match record.kind {
                            RecordKind::Insert => {
                                // Live unless a newer delete already claimed
                                // this copy.
                                if !self.bag_take(&mut tombstones, &record.value) {
                                    result.push(record.value.clone());
                                }
                            }
                            RecordKind::Delete => tombstones.push(record.value.clone()),
                        }
                        cur = node.next;
                    }

                    NodeVariant::Record(_) => cur = node.next,

                    NodeVariant::Leaf(leaf) => {
                        if let Some(idx) =
                            leaf.keys.iter().position(|k| self.key_equal(k, key))
                        {
                            for value in &leaf.values[idx] {
                                if !self.bag_take(&mut tombstones, value) {
                                    result.push(value.clone());
                                }
                            }
                        }
                        return result;
                    }

                    NodeVariant::Split(split) => {
                        if self.key_ge(key, &split.pivot) {
                            // The answer moved to the sibling; keep the
                            // tombstones gathered so far, they shadow copies
                            // regardless of which chain holds them.
                            cur = self.mapping.get(split.right, guard);
                            if cur.is_null() {
                                continue 'restart;
                            }
                        } else {
                            cur = node.next;
                        }
                    }

                    NodeVariant::Merge(merge) => {
                        cur = if self.key_ge(key, &merge.pivot) {
                            merge.original
                        } else {
                            node.next
                        };
                        if cur.is_null() {
                            continue 'restart;
                        }
                    }

                    NodeVariant::Remove => {
                        warn_log!(pid = node.pid, "lookup hit removed node; restarting");
                        continue 'restart;
                    }

                    NodeVariant::Inner(_)
                    | NodeVariant::IndexEntry(_)
                    | NodeVariant::DeleteIndex(_) => {
                        unreachable!(
                            "{} record on leaf chain pid {}",
                            node.variant_name(),
                            node.pid
                        )
                    }
                }
            }
        }
    }

    /// Live-value census for a delete: `(total live values for key,
    /// how many of them equal value)`, computed over the chain at `head`.
    pub(super) fn count_pair(&self, key: &K, value: &V, head: *mut Node<K, V>) -> (usize, usize) {
        let mut total: usize = 0;
        let mut matching: usize = 0;
        let mut tombstones: Vec<V> = Vec::new();

        let mut cur: *mut Node<K, V> = head;
        loop {
            // SAFETY: head was loaded under the caller's guard; chain-next
            // pointers stay valid with it.
            let node: &Node<K, V> = unsafe { &*cur };

            match &node.variant {
                NodeVariant::Record(record) if self.key_equal(&record.key, key) => {
                    match record.kind {
                        RecordKind::Insert => {
                            if !self.bag_take(&mut tombstones, &record.value) {
                                total += 1;
                                if self.value_equal(&record.value, value) {
                                    matching += 1;
                                }
                            }
                        }
                        RecordKind::Delete => tombstones.push(record.value.clone()),
                    }
                    cur = node.next;
                }

                NodeVariant::Record(_) => cur = node.next,

                NodeVariant::Leaf(leaf) => {
                    if let Some(idx) = leaf.keys.iter().position(|k| self.key_equal(k, key)) {
                        for v in &leaf.values[idx] {
                            if self.bag_take(&mut tombstones, v) {
                                continue;
                            }
                            total += 1;
                            if self.value_equal(v, value) {
                                matching += 1;
                            }
                        }
                    }
                    return (total, matching);
                }

                NodeVariant::Merge(merge) => {
                    cur = if self.key_ge(key, &merge.pivot) {
                        merge.original
                    } else {
                        node.next
                    };
                    assert!(!cur.is_null(), "merge delta holds no chain");
                }

                // The caller verified the key against the head's range, and
                // every record above a split delta carries the tightened
                // high bound, so the redirected side is unreachable here.
                NodeVariant::Split(split) => {
                    assert!(
                        self.key_lt(key, &split.pivot),
                        "pair count walked into a split's moved half"
                    );
                    cur = node.next;
                }

                NodeVariant::Inner(_)
                | NodeVariant::IndexEntry(_)
                | NodeVariant::Remove
                | NodeVariant::DeleteIndex(_) => {
                    unreachable!(
                        "{} record on leaf chain pid {}",
                        node.variant_name(),
                        node.pid
                    )
                }
            }
        }
    }

    /// Whether `key` has at least one live value on the chain at `head`.
    pub(super) fn key_is_in(&self, key: &K, head: *mut Node<K, V>) -> bool {
        let mut tombstones: Vec<V> = Vec::new();

        let mut cur: *mut Node<K, V> = head;
        loop {
            // SAFETY: head was loaded under the caller's guard.
            let node: &Node<K, V> = unsafe { &*cur };

            match &node.variant {
                NodeVariant::Record(record) if self.key_equal(&record.key, key) => {
                    match record.kind {
                        RecordKind::Insert => {
                            if !self.bag_take(&mut tombstones, &record.value) {
                                return true;
                            }
                        }
                        RecordKind::Delete => tombstones.push(record.value.clone()),
                    }
                    cur = node.next;
                }

                NodeVariant::Record(_) => cur = node.next,

                NodeVariant::Leaf(leaf) => {
                    if let Some(idx) = leaf.keys.iter().position(|k| self.key_equal(k, key)) {
                        return leaf.values[idx]
                            .iter()
                            .any(|v| !self.bag_take(&mut tombstones, v));
                    }
                    return false;
                }

                NodeVariant::Merge(merge) => {
                    cur = if self.key_ge(key, &merge.pivot) {
                        merge.original
                    } else {
                        node.next
                    };
                    assert!(!cur.is_null(), "merge delta holds no chain");
                }

                NodeVariant::Split(split) => {
                    assert!(
                        self.key_lt(key, &split.pivot),
                        "presence check walked into a split's moved half"
                    );
                    cur = node.next;
                }

                NodeVariant::Inner(_)
                | NodeVariant::IndexEntry(_)
                | NodeVariant::Remove
                | NodeVariant::DeleteIndex(_) => {
                    unreachable!(
                        "{} record on leaf chain pid {}",
                        node.variant_name(),
                        node.pid
                    )
                }
            }
        }
    }

    /// Materialize a leaf chain: sorted keys with their value bags.
    ///
    /// Replays deltas oldest-first on top of the base, checking each record
    /// delta's slot count against the folded state.
    pub(super) fn fold_leaf(&self, head: *mut Node<K, V>) -> (Vec<K>, Vec<Vec<V>>) {
        let records = Self::chain_records(head);
        let mut records = records.into_iter().rev();

        // The bottom of the chain must be the leaf base.
        let Some(base_ptr) = records.next() else {
            unreachable!("fold of an empty chain")
        };
        // SAFETY: chain pointers are protected by the caller's guard.
        let base: &Node<K, V> = unsafe { &*base_ptr };
        let NodeVariant::Leaf(leaf) = &base.variant else {
            unreachable!("leaf chain pid {} ends in {}", base.pid, base.variant_name())
        };

        let mut keys: Vec<K> = leaf.keys.clone();
        let mut values: Vec<Vec<V>> = leaf.values.clone();

        for delta_ptr in records {
            // SAFETY: protected as above.
            let delta: &Node<K, V> = unsafe { &*delta_ptr };
            match &delta.variant {
                NodeVariant::Record(record) => {
                    match record.kind {
                        RecordKind::Insert => {
                            if let Some(idx) =
                                keys.iter().position(|k| self.key_equal(k, &record.key))
                            {
                                values[idx].push(record.value.clone());
                            } else {
                                // New key: splice it in at its sorted spot.
                                let pos = keys
                                    .iter()
                                    .rposition(|k| self.key_ge(&record.key, k))
                                    .map_or(0, |p| p + 1);
                                keys.insert(pos, record.key.clone());
                                values.insert(pos, vec![record.value.clone()]);
                            }
                        }
                        RecordKind::Delete => {
                            if let Some(idx) =
                                keys.iter().position(|k| self.key_equal(k, &record.key))
                            {
                                let bag = &mut values[idx];
                                if let Some(vpos) =
                                    bag.iter().position(|v| self.value_equal(v, &record.value))
                                {
                                    bag.remove(vpos);
                                }
                                if bag.is_empty() {
                                    keys.remove(idx);
                                    values.remove(idx);
                                }
                            }
                        }
                    }
                    assert_eq!(
                        keys.len(),
                        delta.slot_use,
                        "folded leaf disagrees with recorded slot count on pid {}",
                        delta.pid
                    );
                }

                NodeVariant::Split(split) => {
                    // Everything at or past the pivot now lives on the
                    // sibling chain.
                    if let Some(idx) =
                        keys.iter().position(|k| self.key_ge(k, &split.pivot))
                    {
                        keys.truncate(idx);
                        values.truncate(idx);
                    }
                }

                NodeVariant::Merge(_) | NodeVariant::Remove => {}

                NodeVariant::Leaf(_)
                | NodeVariant::Inner(_)
                | NodeVariant::IndexEntry(_)
                | NodeVariant::DeleteIndex(_) => {
                    unreachable!(
                        "{} record above leaf base on pid {}",
                        delta.variant_name(),
                        delta.pid
                    )
                }
            }
        }

        (keys, values)
    }

    /// Materialize an inner chain: sorted separators and the child PID list
    /// (always one entry longer).
    pub(super) fn fold_inner(&self, head: *mut Node<K, V>) -> (Vec<K>, Vec<Pid>) {
        let records = Self::chain_records(head);
        let mut records = records.into_iter().rev();

        let Some(base_ptr) = records.next() else {
            unreachable!("fold of an empty chain")
        };
        // SAFETY: chain pointers are protected by the caller's guard.
        let base: &Node<K, V> = unsafe { &*base_ptr };
        let NodeVariant::Inner(inner) = &base.variant else {
            unreachable!("inner chain pid {} ends in {}", base.pid, base.variant_name())
        };

        let mut keys: Vec<K> = inner.keys.clone();
        let mut children: Vec<Pid> = inner.children.clone();

        for delta_ptr in records {
            // SAFETY: protected as above.
            let delta: &Node<K, V> = unsafe { &*delta_ptr };
            match &delta.variant {
                NodeVariant::IndexEntry(entry) => {
                    let pos = keys
                        .iter()
                        .position(|k| self.key_lt(&entry.low, k))
                        .unwrap_or(keys.len());
                    keys.insert(pos, entry.low.clone());
                    children.insert(pos + 1, entry.right);
                }

                NodeVariant::Split(split) => {
                    if let Some(idx) =
                        keys.iter().position(|k| self.key_ge(k, &split.pivot))
                    {
                        keys.truncate(idx);
                        children.truncate(idx + 1);
                    }
                }

                NodeVariant::Leaf(_)
                | NodeVariant::Inner(_)
                | NodeVariant::Record(_)
                | NodeVariant::Merge(_)
                | NodeVariant::Remove
                | NodeVariant::DeleteIndex(_) => {
                    unreachable!(
                        "{} record above inner base on pid {}",
                        delta.variant_name(),
                        delta.pid
                    )
                }
            }
        }

        debug_assert_eq!(children.len(), keys.len() + 1);
        (keys, children)
    }

    /// Collect the chain head-first into a vector for replay.
    fn chain_records(head: *mut Node<K, V>) -> Vec<*mut Node<K, V>> {
        let mut records: Vec<*mut Node<K, V>> = Vec::new();
        let mut cur = head;
        while !cur.is_null() {
            records.push(cur);
            // SAFETY: chain pointers are protected by the caller's guard.
            cur = unsafe { (*cur).next };
        }
        records
    }
}
