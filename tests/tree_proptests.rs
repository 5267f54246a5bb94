//! Property-based differential tests against a `BTreeMap<u64, Vec<u64>>`
//! oracle. Small key/value domains force collisions, duplicate pairs, and
//! plenty of splits with 8-slot nodes.

mod common;

use std::collections::BTreeMap;

use bwtree::TreeError;
use common::{small_nodes, u64_tree};
use proptest::prelude::*;

/// One scripted operation.
#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u64),
    Delete(u64, u64),
    Lookup(u64),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            4 => (0..48u64, 0..6u64).prop_map(|(k, v)| Op::Insert(k, v)),
            2 => (0..48u64, 0..6u64).prop_map(|(k, v)| Op::Delete(k, v)),
            1 => (0..48u64).prop_map(Op::Lookup),
        ],
        0..=max_ops,
    )
}

/// Remove one matching value from the oracle; true if one was there.
fn oracle_delete(model: &mut BTreeMap<u64, Vec<u64>>, key: u64, value: u64) -> bool {
    let Some(bag) = model.get_mut(&key) else {
        return false;
    };
    let Some(pos) = bag.iter().position(|v| *v == value) else {
        return false;
    };
    bag.remove(pos);
    if bag.is_empty() {
        model.remove(&key);
    }
    true
}

fn sorted(mut bag: Vec<u64>) -> Vec<u64> {
    bag.sort_unstable();
    bag
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Insert/delete/lookup agree with the oracle at every step, and the
    /// final scan reproduces the oracle exactly.
    #[test]
    fn matches_oracle(ops in operations(400)) {
        let tree = u64_tree(small_nodes());
        let mut model: BTreeMap<u64, Vec<u64>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key, value) => {
                    tree.insert(key, value).unwrap();
                    model.entry(key).or_default().push(value);
                }
                Op::Delete(key, value) => {
                    let oracle_had_it = oracle_delete(&mut model, key, value);
                    let outcome = tree.delete(key, value);
                    prop_assert_eq!(
                        outcome.is_ok(),
                        oracle_had_it,
                        "delete({}, {}) diverged from oracle", key, value
                    );
                    if !oracle_had_it {
                        prop_assert_eq!(outcome, Err(TreeError::NotFound));
                    }
                }
                Op::Lookup(key) => {
                    let expected = model.get(&key).cloned().unwrap_or_default();
                    prop_assert_eq!(sorted(tree.lookup(&key)), sorted(expected));
                }
            }
        }

        let scanned: BTreeMap<u64, Vec<u64>> = tree
            .scan()
            .into_iter()
            .map(|(k, bag)| (k, sorted(bag)))
            .collect();
        let model: BTreeMap<u64, Vec<u64>> = model
            .into_iter()
            .map(|(k, bag)| (k, sorted(bag)))
            .collect();
        prop_assert_eq!(scanned, model);
    }

    /// scan_all is the ascending-key flattening of scan.
    #[test]
    fn scan_all_flattens_scan(keys in prop::collection::vec(0..200u64, 0..300)) {
        let tree = u64_tree(small_nodes());
        for (idx, key) in keys.iter().enumerate() {
            tree.insert(*key, idx as u64).unwrap();
        }

        let grouped = tree.scan();
        prop_assert!(grouped.windows(2).all(|w| w[0].0 < w[1].0));

        let flattened: Vec<u64> = grouped.into_iter().flat_map(|(_, bag)| bag).collect();
        prop_assert_eq!(flattened, tree.scan_all());
    }

    /// Unique mode never lets a key grow past one live value, and reports
    /// duplicates exactly when the oracle has the key.
    #[test]
    fn unique_mode_holds_cardinality(ops in operations(200)) {
        let tree = u64_tree(small_nodes().unique());
        let mut model: BTreeMap<u64, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key, value) => {
                    let outcome = tree.insert(key, value);
                    if model.contains_key(&key) {
                        prop_assert_eq!(outcome, Err(TreeError::DuplicateKey));
                    } else {
                        prop_assert!(outcome.is_ok());
                        model.insert(key, value);
                    }
                }
                Op::Delete(key, value) => {
                    let oracle_had_it = model.get(&key) == Some(&value);
                    if oracle_had_it {
                        model.remove(&key);
                    }
                    prop_assert_eq!(tree.delete(key, value).is_ok(), oracle_had_it);
                }
                Op::Lookup(key) => {
                    let found = tree.lookup(&key);
                    prop_assert!(found.len() <= 1);
                    prop_assert_eq!(found.first(), model.get(&key));
                }
            }
        }
    }
}
