//! `BwTree`: the index object and its public operations.
//!
//! Each operation follows the same shape: traverse to the target PID, build
//! an immutable delta (or a consolidated base), and publish it with one CAS
//! on the mapping-table slot. A lost CAS never surfaces to the caller; the
//! operation restarts from the root. The successful CAS is the operation's
//! linearization point.

use std::fmt;
use std::sync::atomic::AtomicU64;

use seize::{Collector, LocalGuard};

use crate::config::{SlotBudget, TreeConfig};
use crate::mapping::MappingTable;
use crate::node::{KeyBound, Node, Pid, RecordKind, NULL_PID};
use crate::ordering::READ_ORD;
use crate::tracing_helpers::{debug_log, trace_log};

mod consolidate;
mod fold;
mod split;
mod traverse;


/// Errors surfaced to callers. Everything else (lost CAS races, structural
/// drift after a split) is retried internally and never escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeError {
    /// Unique-mode insert of a key that already has a live value.
    DuplicateKey,

    /// Delete of a `(key, value)` pair that is not in the index.
    NotFound,
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey => write!(f, "key already present in unique index"),

            Self::NotFound => write!(f, "no matching key/value pair"),
        }
    }
}

impl std::error::Error for TreeError {}

/// A latch-free, ordered, multi-valued index.
///
/// Keys are ordered by a supplied strict-less comparator and compared with a
/// supplied equality predicate; values are opaque and carry their own
/// equality predicate. One key maps to a bag of values.
///
/// All operations take `&self`; the tree is shared across threads behind an
/// `Arc` without any external locking.
///
/// # Type Parameters
///
/// * `K` - key type
/// * `V` - value type (an opaque record locator)
/// * `L` - strict key ordering, `less(a, b)`
/// * `E` - key equality
/// * `Q` - value equality
pub struct BwTree<K, V, L, E, Q> {
    /// Sole resolver from PID to chain head.
    mapping: MappingTable<K, V>,

    /// Deferred-reclamation domain for retired chains.
    collector: Collector,

    /// PID of the current root chain. Swung by CAS when a root split
    /// installs a new root.
    root: AtomicU64,

    /// PID of the first leaf in the horizontal leaf list.
    head_leaf: AtomicU64,

    less: L,
    key_eq: E,
    value_eq: Q,

    config: TreeConfig,
    budget: SlotBudget,
}

impl<K, V, L, E, Q> BwTree<K, V, L, E, Q>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: Fn(&K, &K) -> bool,
    E: Fn(&K, &K) -> bool,
    Q: Fn(&V, &V) -> bool,
{
    /// Create an empty index.
    ///
    /// `key_less` must be a strict total order; `key_equal` and
    /// `value_equal` are the equality predicates for keys and values.
    #[must_use]
    pub fn new(key_less: L, key_equal: E, value_equal: Q, config: TreeConfig) -> Self {
        let mapping: MappingTable<K, V> = MappingTable::new();
        let budget = SlotBudget::derive::<K, V>(config.node_size);

        let first_leaf: *mut Node<K, V> = Box::into_raw(Box::new(Node::base_leaf(
            Vec::new(),
            Vec::new(),
            NULL_PID,
            KeyBound::Infinite,
            KeyBound::Infinite,
        )));
        // SAFETY: the node is fresh and unshared.
        let pid: Pid = unsafe { mapping.allocate(first_leaf) };

        Self {
            mapping,
            collector: Collector::new(),
            root: AtomicU64::new(pid),
            head_leaf: AtomicU64::new(pid),
            less: key_less,
            key_eq: key_equal,
            value_eq: value_equal,
            config,
            budget,
        }
    }

    /// Insert one `(key, value)` pair.
    ///
    /// # Errors
    ///
    /// [`TreeError::DuplicateKey`] in unique mode when the key already has a
    /// live value.
    pub fn insert(&self, key: K, value: V) -> Result<(), TreeError> {
        let guard = self.guard();
        loop {
            // 1. Split anything over budget along the key's path.
            self.split_if_needed(&key, &guard);

            // 2. Re-search; a structural change may have moved the leaf.
            let Some(path) = self.search(self.root_pid(), &key, &guard) else {
                continue;
            };
            let Some(&leaf_pid) = path.last() else {
                continue;
            };

            // 3. Cap the chain; also hands back the current head.
            let Some(head_ptr) = self.consolidate(leaf_pid, &guard) else {
                continue;
            };
            // SAFETY: head_ptr protected by the guard.
            let head: &Node<K, V> = unsafe { &*head_ptr };

            // 4. The head observed must still cover the key.
            if !self.key_in_range(&key, head) {
                debug_log!("insert raced a structure change; restarting");
                continue;
            }

            // 5. Duplicate handling decides both the outcome in unique mode
            //    and whether the key count of the leaf grows.
            let present: bool = self.key_is_in(&key, head_ptr);
            if self.config.unique_keys && present {
                return Err(TreeError::DuplicateKey);
            }
            let slot_use = if present {
                head.slot_use
            } else {
                head.slot_use + 1
            };

            // 6-7. Build the delta and publish it.
            let delta = Node::record_delta(
                RecordKind::Insert,
                key.clone(),
                value.clone(),
                head,
                head_ptr,
                slot_use,
            );
            let delta_ptr: *mut Node<K, V> = Box::into_raw(Box::new(delta));
            // SAFETY: delta_ptr is fresh and unshared until the CAS wins.
            if unsafe { self.mapping.install(leaf_pid, head_ptr, delta_ptr) } {
                return Ok(());
            }

            // SAFETY: the CAS lost, so the delta was never published.
            unsafe { drop(Box::from_raw(delta_ptr)) };
            trace_log!("insert record cas lost; redo");
        }
    }

    /// Delete one `(key, value)` pair. One delete consumes exactly one
    /// matching value, even when the bag holds several equal copies.
    ///
    /// # Errors
    ///
    /// [`TreeError::NotFound`] when no matching pair is live.
    pub fn delete(&self, key: K, value: V) -> Result<(), TreeError> {
        let guard = self.guard();
        loop {
            self.split_if_needed(&key, &guard);

            let Some(path) = self.search(self.root_pid(), &key, &guard) else {
                continue;
            };
            let Some(&leaf_pid) = path.last() else {
                continue;
            };

            let Some(head_ptr) = self.consolidate(leaf_pid, &guard) else {
                continue;
            };
            // SAFETY: head_ptr protected by the guard.
            let head: &Node<K, V> = unsafe { &*head_ptr };

            if !self.key_in_range(&key, head) {
                debug_log!("delete raced a structure change; restarting");
                continue;
            }

            // Count the key's live values and how many match ours; the key
            // slot disappears only when we are removing the last value.
            let (total, matching) = self.count_pair(&key, &value, head_ptr);
            if matching == 0 {
                return Err(TreeError::NotFound);
            }
            assert!(
                matching <= total,
                "pair count {matching} exceeds live total {total}"
            );
            // One delete consumes one value, so the key slot disappears
            // exactly when this was the key's last live value.
            let removes_key: bool = total == 1;
            let slot_use = if removes_key {
                head.slot_use - 1
            } else {
                head.slot_use
            };

            let delta = Node::record_delta(
                RecordKind::Delete,
                key.clone(),
                value.clone(),
                head,
                head_ptr,
                slot_use,
            );
            let delta_ptr: *mut Node<K, V> = Box::into_raw(Box::new(delta));
            // SAFETY: delta_ptr is fresh and unshared until the CAS wins.
            if unsafe { self.mapping.install(leaf_pid, head_ptr, delta_ptr) } {
                return Ok(());
            }

            // SAFETY: the CAS lost, so the delta was never published.
            unsafe { drop(Box::from_raw(delta_ptr)) };
            trace_log!("delete record cas lost; redo");
        }
    }

    /// All live values for `key`. Order within the bag is unspecified.
    #[must_use]
    pub fn lookup(&self, key: &K) -> Vec<V> {
        let guard = self.guard();
        self.collect_values(key, &guard)
    }

    /// Every `(key, value-bag)` pair in ascending key order.
    #[must_use]
    pub fn scan(&self) -> Vec<(K, Vec<V>)> {
        let guard = self.guard();
        let mut out: Vec<(K, Vec<V>)> = Vec::new();

        let mut pid: Pid = self.head_leaf.load(READ_ORD);
        while pid != NULL_PID {
            let head_ptr = self.mapping.get(pid, &guard);
            assert!(!head_ptr.is_null(), "leaf list reached cleared pid {pid}");
            // SAFETY: head_ptr protected by the guard.
            let head: &Node<K, V> = unsafe { &*head_ptr };

            let (keys, values) = self.fold_leaf(head_ptr);
            out.extend(keys.into_iter().zip(values));

            pid = head.next_leaf;
        }
        out
    }

    /// Every live value, grouped per key, in ascending key order.
    #[must_use]
    pub fn scan_all(&self) -> Vec<V> {
        self.scan()
            .into_iter()
            .flat_map(|(_, values)| values)
            .collect()
    }

    /// Enter the reclamation domain. Pointers loaded while the guard lives
    /// cannot be freed underneath the caller.
    pub(crate) fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    pub(crate) fn root_pid(&self) -> Pid {
        self.root.load(READ_ORD)
    }

    // Comparison helpers, all built from the three supplied predicates.

    fn key_lt(&self, a: &K, b: &K) -> bool {
        (self.less)(a, b)
    }

    fn key_ge(&self, a: &K, b: &K) -> bool {
        !(self.less)(a, b)
    }

    fn key_equal(&self, a: &K, b: &K) -> bool {
        (self.key_eq)(a, b)
    }

    fn value_equal(&self, a: &V, b: &V) -> bool {
        (self.value_eq)(a, b)
    }

    /// `key < high`, where `Infinite` is +∞.
    fn below_high(&self, key: &K, high: &KeyBound<K>) -> bool {
        match high {
            KeyBound::Infinite => true,
            KeyBound::Finite(h) => self.key_lt(key, h),
        }
    }

    /// `low <= key`, where `Infinite` is -∞.
    fn at_or_above_low(&self, key: &K, low: &KeyBound<K>) -> bool {
        match low {
            KeyBound::Infinite => true,
            KeyBound::Finite(l) => self.key_ge(key, l),
        }
    }

    /// Whether `key` falls in the node's `[low_key, high_key)` range.
    fn key_in_range(&self, key: &K, node: &Node<K, V>) -> bool {
        self.at_or_above_low(key, &node.low_key) && self.below_high(key, &node.high_key)
    }
}

impl<K, V, L, E, Q> fmt::Debug for BwTree<K, V, L, E, Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BwTree")
            .field("root", &self.root)
            .field("head_leaf", &self.head_leaf)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
