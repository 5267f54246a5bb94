//! End-to-end behavior of the public API: fills, splits, bag semantics,
//! unique mode, and scans. Every test starts from an empty index with
//! 8-slot nodes unless noted.

mod common;

use bwtree::{TreeConfig, TreeError};
use common::{small_nodes, u64_tree};

#[test]
fn single_leaf_fill_scans_in_order() {
    common::init_tracing();
    let tree = u64_tree(small_nodes());

    // Insert out of order; values are key * 10.
    for key in [3u64, 1, 7, 2, 8, 5, 4, 6] {
        tree.insert(key, key * 10).unwrap();
    }

    assert_eq!(tree.scan_all(), vec![10, 20, 30, 40, 50, 60, 70, 80]);
}

#[test]
fn ninth_insert_splits_and_both_halves_answer() {
    common::init_tracing();
    let tree = u64_tree(small_nodes());

    for key in 1..=9u64 {
        tree.insert(key, key * 100).unwrap();
    }

    assert_eq!(tree.lookup(&4), vec![400]);
    assert_eq!(tree.lookup(&9), vec![900]);
    assert_eq!(
        tree.scan_all(),
        (1..=9).map(|k| k * 100).collect::<Vec<_>>()
    );
}

#[test]
fn delete_across_a_split() {
    common::init_tracing();
    let tree = u64_tree(small_nodes());

    for key in 1..=9u64 {
        tree.insert(key, key * 100).unwrap();
    }

    tree.delete(9, 900).unwrap();
    assert!(tree.lookup(&9).is_empty());
    assert_eq!(tree.lookup(&8), vec![800]);
}

#[test]
fn duplicate_values_form_a_bag() {
    common::init_tracing();
    let tree = u64_tree(small_nodes());

    tree.insert(5, 1).unwrap(); // a
    tree.insert(5, 2).unwrap(); // b
    tree.insert(5, 1).unwrap(); // a again

    let mut bag = tree.lookup(&5);
    bag.sort_unstable();
    assert_eq!(bag, vec![1, 1, 2]);

    // One delete consumes one copy of a.
    tree.delete(5, 1).unwrap();
    let mut bag = tree.lookup(&5);
    bag.sort_unstable();
    assert_eq!(bag, vec![1, 2]);
}

#[test]
fn unique_mode_rejects_second_value() {
    common::init_tracing();
    let tree = u64_tree(small_nodes().unique());

    tree.insert(42, 1).unwrap();
    assert_eq!(tree.insert(42, 2), Err(TreeError::DuplicateKey));
    assert_eq!(tree.lookup(&42), vec![1]);

    // Deleting frees the key for a fresh insert.
    tree.delete(42, 1).unwrap();
    tree.insert(42, 2).unwrap();
    assert_eq!(tree.lookup(&42), vec![2]);
}

#[test]
fn unique_mode_cardinality_stays_at_most_one() {
    common::init_tracing();
    let tree = u64_tree(small_nodes().unique());

    for key in 0..100u64 {
        tree.insert(key, key).unwrap();
        let _ = tree.insert(key, key + 1);
    }
    for key in 0..100u64 {
        assert!(tree.lookup(&key).len() <= 1);
        assert_eq!(tree.lookup(&key), vec![key]);
    }
}

#[test]
fn insert_lookup_delete_round_trip() {
    common::init_tracing();
    let tree = u64_tree(small_nodes());

    tree.insert(11, 1100).unwrap();
    assert_eq!(tree.lookup(&11), vec![1100]);

    tree.delete(11, 1100).unwrap();
    assert!(tree.lookup(&11).is_empty());
}

#[test]
fn delete_of_absent_pair_reports_not_found() {
    common::init_tracing();
    let tree = u64_tree(small_nodes());

    assert_eq!(tree.delete(1, 1), Err(TreeError::NotFound));

    tree.insert(1, 1).unwrap();
    // Right key, wrong value.
    assert_eq!(tree.delete(1, 2), Err(TreeError::NotFound));
    assert_eq!(tree.lookup(&1), vec![1]);
}

#[test]
fn lookup_of_missing_key_is_empty() {
    common::init_tracing();
    let tree = u64_tree(small_nodes());
    for key in 0..50u64 {
        tree.insert(key * 2, key).unwrap();
    }
    assert!(tree.lookup(&99).is_empty());
    assert!(tree.lookup(&1000).is_empty());
}

#[test]
fn scan_groups_values_per_key() {
    common::init_tracing();
    let tree = u64_tree(small_nodes());

    for key in 0..20u64 {
        tree.insert(key, key).unwrap();
        tree.insert(key, key + 1000).unwrap();
    }

    let scanned = tree.scan();
    assert_eq!(scanned.len(), 20);
    for (idx, (key, bag)) in scanned.into_iter().enumerate() {
        assert_eq!(key, idx as u64);
        let mut bag = bag;
        bag.sort_unstable();
        assert_eq!(bag, vec![key, key + 1000]);
    }
}

#[test]
fn deep_tree_keeps_scan_order() {
    common::init_tracing();
    let tree = u64_tree(small_nodes());

    // 1009 is prime, so this visits every key in 0..1009 exactly once.
    for step in 0..1009u64 {
        let key = step * 557 % 1009;
        tree.insert(key, key).unwrap();
    }

    let scanned = tree.scan_all();
    assert_eq!(scanned.len(), 1009);
    assert!(scanned.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn interleaved_deletes_keep_structure_usable() {
    common::init_tracing();
    let tree = u64_tree(small_nodes());

    for key in 0..200u64 {
        tree.insert(key, key).unwrap();
    }
    for key in (0..200u64).step_by(2) {
        tree.delete(key, key).unwrap();
    }

    for key in 0..200u64 {
        if key % 2 == 0 {
            assert!(tree.lookup(&key).is_empty(), "key {key} should be gone");
        } else {
            assert_eq!(tree.lookup(&key), vec![key]);
        }
    }
    assert_eq!(
        tree.scan_all(),
        (0..200u64).filter(|k| k % 2 == 1).collect::<Vec<_>>()
    );
}

#[test]
fn default_config_still_splits_eventually() {
    common::init_tracing();
    let tree = u64_tree(TreeConfig::default());

    for key in 0..500u64 {
        tree.insert(key, key).unwrap();
    }
    assert_eq!(tree.scan_all().len(), 500);
    assert_eq!(tree.lookup(&499), vec![499]);
}
