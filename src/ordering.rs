//! Memory orderings used at every atomic access point.
//!
//! Naming the orderings keeps the intent visible at the access site and
//! keeps the pairing rules in one place.

use std::sync::atomic::Ordering;

/// Loading a mapping-table slot, page pointer, or the root handle.
/// Pairs with the Release half of an installing CAS.
pub(crate) const READ_ORD: Ordering = Ordering::Acquire;

/// Successful CAS installing a chain head, page, or root.
/// The Release half publishes the node payload built before the CAS.
pub(crate) const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Failed CAS. The observed value is only inspected, never published.
pub(crate) const CAS_FAILURE: Ordering = Ordering::Acquire;

/// PID counter bumps. The slot CAS below carries the synchronization.
pub(crate) const COUNTER_ORD: Ordering = Ordering::Relaxed;
