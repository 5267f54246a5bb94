//! Construction-time configuration and node slot budgets.
//!
//! The index is tuned by a target node size in bytes; the per-node slot
//! limits are derived from it against the concrete key/value sizes, with a
//! floor of 8 slots so degenerate key types still form a usable tree.

use std::mem;

use crate::node::Pid;

/// Floor for the derived slot maxima.
const MIN_SLOTS: usize = 8;

/// Default node budget in bytes.
const DEFAULT_NODE_SIZE: usize = 256;

/// Default delta-chain length above which a chain is consolidated.
const DEFAULT_DELTA_CHAIN_MAX: usize = 8;

/// Configuration for a [`BwTree`](crate::BwTree), passed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Target size of a base node in bytes. Leaf and inner slot maxima are
    /// derived from this against `size_of::<K>()` and `size_of::<V>()`.
    pub node_size: usize,

    /// Delta-chain length above which consolidation is attempted.
    pub delta_chain_max: usize,

    /// Reject inserts whose key already has at least one live value.
    pub unique_keys: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            node_size: DEFAULT_NODE_SIZE,
            delta_chain_max: DEFAULT_DELTA_CHAIN_MAX,
            unique_keys: false,
        }
    }
}

impl TreeConfig {
    /// Configuration with the given node byte budget and defaults elsewhere.
    #[must_use]
    pub fn with_node_size(node_size: usize) -> Self {
        Self {
            node_size,
            ..Self::default()
        }
    }

    /// Enable unique-key mode.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique_keys = true;
        self
    }
}

/// Slot limits derived from a [`TreeConfig`] for concrete `K`/`V` types.
///
/// The minima are what a merge of underfull nodes would trigger on; the
/// merge protocol itself is not implemented, but splits assert that a
/// fresh sibling never starts below its minimum.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotBudget {
    /// Maximum number of key slots in a leaf before it must split.
    pub(crate) leaf_slot_max: usize,

    /// Maximum number of key slots in an inner node before it must split.
    pub(crate) inner_slot_max: usize,

    /// Minimum key slots a leaf should retain.
    pub(crate) min_leaf_slots: usize,

    /// Minimum key slots an inner node should retain.
    pub(crate) min_inner_slots: usize,
}

impl SlotBudget {
    /// Derive slot limits for `K`/`V` from the node byte budget.
    pub(crate) fn derive<K, V>(node_size: usize) -> Self {
        let leaf_entry = (mem::size_of::<K>() + mem::size_of::<V>()).max(1);
        let inner_entry = (mem::size_of::<K>() + mem::size_of::<Pid>()).max(1);

        let leaf_slot_max = MIN_SLOTS.max(node_size / leaf_entry);
        let inner_slot_max = MIN_SLOTS.max(node_size / inner_entry);

        Self {
            leaf_slot_max,
            inner_slot_max,
            min_leaf_slots: leaf_slot_max / 2,
            min_inner_slots: inner_slot_max / 2,
        }
    }
}
