//! PID → chain-head registry.
//!
//! A two-level array indexed by the high and low 10 bits of a PID. Second-
//! level pages are created lazily and raced in with CAS; once installed a
//! page pointer is immutable (the slots inside keep changing). Every
//! mutation of the tree becomes visible through [`MappingTable::install`],
//! a single-word CAS on the owning slot, which is also each operation's
//! linearization point.

pub(crate) mod reclaim;

use std::collections::HashSet;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64};

use seize::{Guard, LocalGuard};

use crate::node::{Node, Pid, NULL_PID};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, COUNTER_ORD, READ_ORD};
use crate::tracing_helpers::trace_log;

/// Bits per tier; each tier indexes 1024 entries.
const TIER_BITS: u32 = 10;

/// Entries per tier.
const TIER_SIZE: usize = 1 << TIER_BITS;

/// Largest number of PIDs the two tiers can address.
const MAX_PIDS: u64 = (TIER_SIZE as u64) * (TIER_SIZE as u64);

/// One lazily allocated second-level page of chain-head slots.
struct SlotPage<K, V> {
    slots: [AtomicPtr<Node<K, V>>; TIER_SIZE],
}

impl<K, V> SlotPage<K, V> {
    fn new() -> Box<Self> {
        Box::new(Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        })
    }
}

/// Two-level registry from PID to the current chain head.
pub(crate) struct MappingTable<K, V> {
    /// First tier; entries transition once from null to a page and then
    /// stay put until the destructor.
    tier1: Box<[AtomicPtr<SlotPage<K, V>>]>,

    /// Next PID to hand out. Dense and monotone; PIDs are never reused.
    next_pid: AtomicU64,

    /// The table owns every node its slots point to.
    _marker: PhantomData<Box<Node<K, V>>>,
}

// SAFETY: the raw node pointers held in the slots are published only through
// release CAS and read through acquire loads; node payloads are immutable
// after publication, and reclamation is deferred until no reader remains.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for MappingTable<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for MappingTable<K, V> {}

#[inline]
fn tier1_index(pid: Pid) -> usize {
    (pid >> TIER_BITS) as usize
}

#[inline]
fn tier2_index(pid: Pid) -> usize {
    (pid & ((TIER_SIZE as u64) - 1)) as usize
}

impl<K, V> MappingTable<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            tier1: (0..TIER_SIZE)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            next_pid: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    /// Current chain head for `pid`, or null for `NULL_PID`, an untouched
    /// tier, or a slot cleared by a split rollback.
    ///
    /// The guard keeps whatever head is returned alive for the duration of
    /// the caller's walk.
    pub(crate) fn get(&self, pid: Pid, _guard: &LocalGuard<'_>) -> *mut Node<K, V> {
        if pid == NULL_PID {
            return ptr::null_mut();
        }
        debug_assert!(pid < MAX_PIDS);

        let page: *mut SlotPage<K, V> = self.tier1[tier1_index(pid)].load(READ_ORD);
        if page.is_null() {
            return ptr::null_mut();
        }

        // SAFETY: a non-null tier-1 entry is an installed page and stays
        // valid until the destructor.
        let page: &SlotPage<K, V> = unsafe { &*page };
        page.slots[tier2_index(pid)].load(READ_ORD)
    }

    /// Reserve a fresh PID and publish `node` as its first chain head.
    ///
    /// The PID is stamped into the node before the slot store so any reader
    /// that can see the head also sees its identity. The slot must make the
    /// empty → head transition; finding it occupied means the allocator
    /// state is corrupt.
    ///
    /// # Safety
    ///
    /// `node` must come from `Box::into_raw` and not be shared yet.
    pub(crate) unsafe fn allocate(&self, node: *mut Node<K, V>) -> Pid {
        let pid: Pid = self.next_pid.fetch_add(1, COUNTER_ORD);
        assert!(pid < MAX_PIDS, "mapping table out of pids");

        // SAFETY: caller guarantees exclusive access before publication.
        unsafe { (*node).pid = pid };

        let tier1_slot = &self.tier1[tier1_index(pid)];
        let mut page: *mut SlotPage<K, V> = tier1_slot.load(READ_ORD);
        if page.is_null() {
            // Race the page in; the loser's buffer is dropped untouched.
            let fresh: *mut SlotPage<K, V> = Box::into_raw(SlotPage::new());
            match tier1_slot.compare_exchange(ptr::null_mut(), fresh, CAS_SUCCESS, CAS_FAILURE) {
                Ok(_) => page = fresh,
                Err(winner) => {
                    // SAFETY: fresh was never published.
                    unsafe { drop(Box::from_raw(fresh)) };
                    page = winner;
                }
            }
        }

        // SAFETY: page is installed and immutable from here on.
        let page: &SlotPage<K, V> = unsafe { &*page };
        let slot = &page.slots[tier2_index(pid)];
        slot.compare_exchange(ptr::null_mut(), node, CAS_SUCCESS, CAS_FAILURE)
            .unwrap_or_else(|_| panic!("freshly allocated pid {pid} already occupied"));

        pid
    }

    /// CAS the slot for `pid` from `expected` to `new`, stamping the PID
    /// into `new` first. On failure the caller still owns `new`.
    ///
    /// # Safety
    ///
    /// `new` must come from `Box::into_raw` and must not be shared until
    /// this call succeeds.
    pub(crate) unsafe fn install(
        &self,
        pid: Pid,
        expected: *mut Node<K, V>,
        new: *mut Node<K, V>,
    ) -> bool {
        // SAFETY: caller guarantees exclusive access to `new` pre-CAS.
        unsafe { (*new).pid = pid };

        let slot = self.slot(pid);
        let swapped = slot
            .compare_exchange(expected, new, CAS_SUCCESS, CAS_FAILURE)
            .is_ok();
        if !swapped {
            trace_log!(pid, "install cas lost");
        }
        swapped
    }

    /// Roll a speculative allocation back: CAS the slot from `expected` to
    /// null. Used only when a split loses the race to publish its sibling.
    pub(crate) fn clear(&self, pid: Pid, expected: *mut Node<K, V>) -> bool {
        self.slot(pid)
            .compare_exchange(expected, ptr::null_mut(), CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Hand a replaced chain to seize; it is freed once no in-flight
    /// operation can still hold a pointer into it.
    ///
    /// # Safety
    ///
    /// `head` must have just been unlinked from its slot by a successful
    /// CAS and must not be retired again.
    pub(crate) unsafe fn retire_chain(&self, head: *mut Node<K, V>, guard: &LocalGuard<'_>) {
        // SAFETY: forwarded from the caller's contract.
        unsafe { guard.defer_retire(head, reclaim::reclaim_chain::<K, V>) };
    }

    fn slot(&self, pid: Pid) -> &AtomicPtr<Node<K, V>> {
        debug_assert!(pid < MAX_PIDS);
        let page: *mut SlotPage<K, V> = self.tier1[tier1_index(pid)].load(READ_ORD);
        assert!(!page.is_null(), "slot access for unallocated pid {pid}");
        // SAFETY: non-null pages are installed and live until the destructor.
        let page: &SlotPage<K, V> = unsafe { &*page };
        &page.slots[tier2_index(pid)]
    }

    /// Highest PID handed out so far plus one.
    #[cfg(test)]
    pub(crate) fn allocated_pids(&self) -> u64 {
        self.next_pid.load(COUNTER_ORD)
    }
}

impl<K, V> Drop for MappingTable<K, V> {
    fn drop(&mut self) {
        // Exclusive access: free every installed chain exactly once, then
        // the pages. The shared visited set covers chains that are also
        // reachable sideways through a merge delta.
        let mut visited: HashSet<usize> = HashSet::new();

        for tier1_slot in self.tier1.iter_mut() {
            let page: *mut SlotPage<K, V> = *tier1_slot.get_mut();
            if page.is_null() {
                continue;
            }

            // SAFETY: page pointers are uniquely owned during drop.
            let page_ref: &mut SlotPage<K, V> = unsafe { &mut *page };
            for slot in page_ref.slots.iter_mut() {
                let head: *mut Node<K, V> = *slot.get_mut();
                // SAFETY: chains in live slots are owned by the table and
                // no reader can exist while it is being dropped.
                unsafe { reclaim::free_chain(head, &mut visited) };
            }

            // SAFETY: the page came from Box::into_raw in allocate().
            unsafe { drop(Box::from_raw(page)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::KeyBound;
    use seize::Collector;

    fn empty_leaf() -> *mut Node<u64, u64> {
        Box::into_raw(Box::new(Node::base_leaf(
            vec![],
            vec![],
            NULL_PID,
            KeyBound::Infinite,
            KeyBound::Infinite,
        )))
    }

    #[test]
    fn allocate_returns_dense_pids() {
        let table: MappingTable<u64, u64> = MappingTable::new();
        let collector = Collector::new();
        let guard = collector.enter();

        for expected in 0..5u64 {
            let node = empty_leaf();
            // SAFETY: node is fresh and unshared.
            let pid = unsafe { table.allocate(node) };
            assert_eq!(pid, expected);
            assert_eq!(table.get(pid, &guard), node);
            // SAFETY: published node is still valid; table owns it.
            assert_eq!(unsafe { (*node).pid }, pid);
        }
        assert_eq!(table.allocated_pids(), 5);
    }

    #[test]
    fn get_null_pid_is_null() {
        let table: MappingTable<u64, u64> = MappingTable::new();
        let collector = Collector::new();
        let guard = collector.enter();
        assert!(table.get(NULL_PID, &guard).is_null());
    }

    #[test]
    fn install_swings_only_from_expected() {
        let table: MappingTable<u64, u64> = MappingTable::new();
        let collector = Collector::new();
        let guard = collector.enter();

        let first = empty_leaf();
        // SAFETY: fresh node.
        let pid = unsafe { table.allocate(first) };

        let second = empty_leaf();
        // Wrong expected value: CAS must fail and leave the slot alone.
        // SAFETY: second is fresh and unshared.
        assert!(!unsafe { table.install(pid, ptr::null_mut(), second) });
        assert_eq!(table.get(pid, &guard), first);

        // SAFETY: second is still owned by us.
        assert!(unsafe { table.install(pid, first, second) });
        assert_eq!(table.get(pid, &guard), second);

        // The replaced head is ours again; free it directly, it was never
        // observable by another thread in this test.
        let mut visited = HashSet::new();
        // SAFETY: first was unlinked by the successful install above.
        unsafe { reclaim::free_chain(first, &mut visited) };
    }

    #[test]
    fn pids_spanning_multiple_pages() {
        let table: MappingTable<u64, u64> = MappingTable::new();
        let collector = Collector::new();
        let guard = collector.enter();

        // Cross the first 1024-slot page boundary.
        let mut last = 0;
        for _ in 0..(TIER_SIZE + 4) {
            // SAFETY: fresh node per iteration.
            last = unsafe { table.allocate(empty_leaf()) };
        }
        assert_eq!(last, TIER_SIZE as u64 + 3);
        assert!(!table.get(last, &guard).is_null());
        assert!(!table.get(0, &guard).is_null());
    }

    #[test]
    fn clear_rolls_back_a_speculative_slot() {
        let table: MappingTable<u64, u64> = MappingTable::new();
        let collector = Collector::new();
        let guard = collector.enter();

        let node = empty_leaf();
        // SAFETY: fresh node.
        let pid = unsafe { table.allocate(node) };
        assert!(table.clear(pid, node));
        assert!(table.get(pid, &guard).is_null());

        // SAFETY: node was unlinked by clear and never shared.
        let mut visited = HashSet::new();
        unsafe { reclaim::free_chain(node, &mut visited) };
    }
}
