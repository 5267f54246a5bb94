//! Shared integration-test helpers: tracing bootstrap and tree builders.
//!
//! Set `RUST_LOG` to see the index's internals during a test run, e.g.
//! `RUST_LOG=bwtree=trace cargo test --features tracing`.

#![allow(dead_code)]

use std::sync::Once;

use bwtree::{BwTree, TreeConfig};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the test tracing subscriber. Safe to call from every test; only
/// the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Comparator shape shared by all u64 test trees.
pub type Cmp = fn(&u64, &u64) -> bool;

/// The concrete tree type used across the integration suite.
pub type U64Tree = BwTree<u64, u64, Cmp, Cmp, Cmp>;

/// Build a `u64 -> u64` tree with natural ordering.
pub fn u64_tree(config: TreeConfig) -> U64Tree {
    let less: Cmp = |a, b| a < b;
    let key_eq: Cmp = |a, b| a == b;
    let value_eq: Cmp = |a, b| a == b;
    BwTree::new(less, key_eq, value_eq, config)
}

/// Config yielding 8-slot leaves and inner nodes for u64 keys and values.
pub fn small_nodes() -> TreeConfig {
    TreeConfig::with_node_size(128)
}
