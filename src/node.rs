//! Node and delta-chain data model.
//!
//! Every logical node is a chain of immutable records: zero or more deltas
//! linked through `next`, terminated by exactly one base node. The chain
//! head is what the mapping table stores; prepending a delta and swinging
//! the slot is how every mutation becomes visible.
//!
//! All variants share one header (`Node`) so traversal can read the key
//! range, slot count, and chain length of whatever record currently heads
//! a chain without touching the payload.

use std::fmt;
use std::ptr;

use crate::config::SlotBudget;

/// Logical page identifier, resolved exclusively through the mapping table.
pub(crate) type Pid = u64;

/// Sentinel for "no node".
pub(crate) const NULL_PID: Pid = Pid::MAX;

/// One end of a node's key range. `Infinite` stands for -∞ on the low end
/// and +∞ on the high end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KeyBound<K> {
    Infinite,
    Finite(K),
}

/// Direction of a [`RecordDelta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    Insert,
    Delete,
}

/// Leaf base payload: parallel sorted key array and per-key value bags.
pub(crate) struct LeafData<K, V> {
    pub(crate) keys: Vec<K>,
    pub(crate) values: Vec<Vec<V>>,
}

/// Inner base payload: `children[i]` covers `[keys[i-1], keys[i])` with the
/// node's own bounds at the ends, so `children.len() == keys.len() + 1`.
pub(crate) struct InnerData<K> {
    pub(crate) keys: Vec<K>,
    pub(crate) children: Vec<Pid>,
}

/// A single insert or delete of one `(key, value)` pair. Leaf chains only.
pub(crate) struct RecordDelta<K, V> {
    pub(crate) kind: RecordKind,
    pub(crate) key: K,
    pub(crate) value: V,
}

/// Logically truncates the node at `pivot` and redirects keys `>= pivot`
/// to the sibling chain at `right`.
pub(crate) struct SplitDelta<K> {
    pub(crate) pivot: K,
    pub(crate) right: Pid,
}

/// Parent-side notice that the child at `right` now covers `[low, high)`.
pub(crate) struct IndexEntryDelta<K> {
    pub(crate) low: K,
    pub(crate) high: KeyBound<K>,
    pub(crate) right: Pid,
}

/// Second step of the merge protocol; holds a borrow of the merged-away
/// chain's head. Never installed: the merge protocol is not implemented.
#[allow(dead_code)]
pub(crate) struct MergeDelta<K, V> {
    pub(crate) pivot: K,
    pub(crate) original: *mut Node<K, V>,
}

/// Parent-side removal of an index term. Never installed.
#[allow(dead_code)]
pub(crate) struct DeleteIndexDelta<K> {
    pub(crate) low: K,
    pub(crate) high: KeyBound<K>,
    pub(crate) right: Pid,
}

/// Closed union over base nodes and every delta variant. The last three
/// belong to the merge protocol: traversal and folding dispatch on them,
/// but no operation installs them.
pub(crate) enum NodeVariant<K, V> {
    Leaf(LeafData<K, V>),
    Inner(InnerData<K>),
    Record(RecordDelta<K, V>),
    Split(SplitDelta<K>),
    IndexEntry(IndexEntryDelta<K>),
    #[allow(dead_code)]
    Remove,
    #[allow(dead_code)]
    Merge(MergeDelta<K, V>),
    #[allow(dead_code)]
    DeleteIndex(DeleteIndexDelta<K>),
}

/// Header shared by every record in a chain, plus the variant payload.
pub(crate) struct Node<K, V> {
    /// Next record down the chain; null exactly on base nodes.
    pub(crate) next: *mut Node<K, V>,

    /// Number of deltas above the base, counting this record.
    pub(crate) delta_len: usize,

    /// PID of the chain this record belongs to. Stamped before publication.
    pub(crate) pid: Pid,

    /// Whether this chain is a leaf chain.
    pub(crate) is_leaf: bool,

    /// Next leaf in the horizontal leaf list; `NULL_PID` on inner chains
    /// and on the rightmost leaf.
    pub(crate) next_leaf: Pid,

    /// Inclusive low bound of the key range.
    pub(crate) low_key: KeyBound<K>,

    /// Exclusive high bound of the key range.
    pub(crate) high_key: KeyBound<K>,

    /// Logical key-slot count after applying this record.
    pub(crate) slot_use: usize,

    pub(crate) variant: NodeVariant<K, V>,
}

impl<K, V> Node<K, V> {
    /// Fresh leaf base. Chain length and next pointer start at zero.
    pub(crate) fn base_leaf(
        keys: Vec<K>,
        values: Vec<Vec<V>>,
        next_leaf: Pid,
        low_key: KeyBound<K>,
        high_key: KeyBound<K>,
    ) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        let slot_use = keys.len();
        Self {
            next: ptr::null_mut(),
            delta_len: 0,
            pid: NULL_PID,
            is_leaf: true,
            next_leaf,
            low_key,
            high_key,
            slot_use,
            variant: NodeVariant::Leaf(LeafData { keys, values }),
        }
    }

    /// Fresh inner base.
    pub(crate) fn base_inner(
        keys: Vec<K>,
        children: Vec<Pid>,
        low_key: KeyBound<K>,
        high_key: KeyBound<K>,
    ) -> Self {
        debug_assert_eq!(children.len(), keys.len() + 1);
        let slot_use = keys.len();
        Self {
            next: ptr::null_mut(),
            delta_len: 0,
            pid: NULL_PID,
            is_leaf: false,
            next_leaf: NULL_PID,
            low_key,
            high_key,
            slot_use,
            variant: NodeVariant::Inner(InnerData { keys, children }),
        }
    }

    /// True if this record terminates a chain.
    pub(crate) fn is_base(&self) -> bool {
        matches!(
            self.variant,
            NodeVariant::Leaf(_) | NodeVariant::Inner(_)
        )
    }

    /// Whether the logical node is over its slot budget and must split.
    pub(crate) fn needs_split(&self, budget: &SlotBudget) -> bool {
        if self.is_leaf {
            self.slot_use >= budget.leaf_slot_max
        } else {
            self.slot_use >= budget.inner_slot_max
        }
    }

    /// Short tag name for logs and debug output.
    pub(crate) fn variant_name(&self) -> &'static str {
        match self.variant {
            NodeVariant::Leaf(_) => "leaf",
            NodeVariant::Inner(_) => "inner",
            NodeVariant::Record(RecordDelta {
                kind: RecordKind::Insert,
                ..
            }) => "record/insert",
            NodeVariant::Record(RecordDelta {
                kind: RecordKind::Delete,
                ..
            }) => "record/delete",
            NodeVariant::Split(_) => "split",
            NodeVariant::IndexEntry(_) => "index-entry",
            NodeVariant::Remove => "remove",
            NodeVariant::Merge(_) => "merge",
            NodeVariant::DeleteIndex(_) => "delete-index",
        }
    }
}

impl<K: Clone, V> Node<K, V> {
    /// Record delta prepended onto the chain headed by `head` (at `head_ptr`).
    ///
    /// `slot_use` is supplied by the caller: it changes only when the key's
    /// presence in the leaf changes as a whole.
    pub(crate) fn record_delta(
        kind: RecordKind,
        key: K,
        value: V,
        head: &Node<K, V>,
        head_ptr: *mut Node<K, V>,
        slot_use: usize,
    ) -> Self {
        Self {
            next: head_ptr,
            delta_len: head.delta_len + 1,
            pid: head.pid,
            is_leaf: head.is_leaf,
            next_leaf: head.next_leaf,
            low_key: head.low_key.clone(),
            high_key: head.high_key.clone(),
            slot_use,
            variant: NodeVariant::Record(RecordDelta { kind, key, value }),
        }
    }

    /// Split delta: tightens the high bound to `pivot` and redirects the
    /// upper half to `right`. `retained` is the slot count kept on this side.
    pub(crate) fn split_delta(
        pivot: K,
        right: Pid,
        retained: usize,
        head: &Node<K, V>,
        head_ptr: *mut Node<K, V>,
    ) -> Self {
        Self {
            next: head_ptr,
            delta_len: head.delta_len + 1,
            pid: head.pid,
            is_leaf: head.is_leaf,
            next_leaf: if head.is_leaf { right } else { head.next_leaf },
            low_key: head.low_key.clone(),
            high_key: KeyBound::Finite(pivot.clone()),
            slot_use: retained,
            variant: NodeVariant::Split(SplitDelta { pivot, right }),
        }
    }

    /// Index-entry delta announcing the new child `right` over `[low, high)`.
    pub(crate) fn index_entry_delta(
        low: K,
        high: KeyBound<K>,
        right: Pid,
        head: &Node<K, V>,
        head_ptr: *mut Node<K, V>,
    ) -> Self {
        Self {
            next: head_ptr,
            delta_len: head.delta_len + 1,
            pid: head.pid,
            is_leaf: head.is_leaf,
            next_leaf: head.next_leaf,
            low_key: head.low_key.clone(),
            high_key: head.high_key.clone(),
            slot_use: head.slot_use + 1,
            variant: NodeVariant::IndexEntry(IndexEntryDelta { low, high, right }),
        }
    }
}

impl<K, V> fmt::Debug for Node<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("variant", &self.variant_name())
            .field("pid", &self.pid)
            .field("delta_len", &self.delta_len)
            .field("slot_use", &self.slot_use)
            .field("is_leaf", &self.is_leaf)
            .finish_non_exhaustive()
    }
}
