//! # bwtree
//!
//! A latch-free, ordered, multi-valued in-memory index in the Bw-Tree style.
//!
//! Updates never mutate a node in place. Every logical mutation is a small
//! immutable *delta record* prepended to a per-node chain with a single
//! compare-and-swap on a *mapping table* slot, and chains are periodically
//! *consolidated* into fresh base nodes. Structural changes (splits) go
//! through the same delta mechanism, so readers are never blocked and never
//! observe a half-applied change.
//!
//! ## Design
//!
//! - Logical node identity is a dense page id (PID); the mapping table is the
//!   only resolver from PID to the current chain head.
//! - Readers and writers share nothing but atomic loads and CAS; a failed CAS
//!   means another thread made progress, and the operation restarts.
//! - One key maps to a bag of values; deletes consume one matching value.
//! - Retired chains are reclaimed through [`seize`] once no in-flight
//!   operation can still observe them.
//!
//! ## Example
//!
//! ```
//! use bwtree::{BwTree, TreeConfig};
//!
//! let tree = BwTree::new(
//!     |a: &u64, b: &u64| a < b,
//!     |a: &u64, b: &u64| a == b,
//!     |a: &u64, b: &u64| a == b,
//!     TreeConfig::default(),
//! );
//!
//! tree.insert(7, 700).unwrap();
//! tree.insert(7, 701).unwrap();
//! assert_eq!(tree.lookup(&7).len(), 2);
//!
//! tree.delete(7, 700).unwrap();
//! assert_eq!(tree.lookup(&7), vec![701]);
//! ```

mod config;
mod mapping;
mod node;
mod ordering;
mod tracing_helpers;
mod tree;

pub use config::TreeConfig;
pub use tree::{BwTree, TreeError};
