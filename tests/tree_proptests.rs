//! Property-based tests for the `tree` module.
//!
//! These tests verify invariants and properties that should hold for all inputs.
//! Uses differential testing against `BTreeMap` as an oracle.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

use olckv::epoch::EpochManager;
use olckv::{BPlusTree, InsertError, MAX_KEY_SIZE};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

// ============================================================================
//  Strategies
// ============================================================================

/// Short keys (0-16 bytes): many entries per leaf.
fn short_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=16)
}

/// Keys up to the maximum length: few entries per leaf, many splits.
fn wide_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 64..=MAX_KEY_SIZE)
}

/// Any valid key, mostly short.
fn valid_key() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        4 => short_key(),
        1 => wide_key(),
    ]
}

/// Operations for random testing.
#[derive(Debug, Clone)]
enum Op {
    Insert(Vec<u8>, u64),
    Lookup(Vec<u8>),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (valid_key(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
            2 => valid_key().prop_map(Op::Lookup),
        ],
        0..=max_ops,
    )
}

fn new_tree(epochs: &EpochManager) -> BPlusTree<u64> {
    BPlusTree::new(epochs.reclaimer())
}

// ============================================================================
//  Basic Insert/Lookup Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Every inserted key is found with its value.
    #[test]
    fn insert_then_lookup_returns_value(key in valid_key(), value: u64) {
        let epochs = EpochManager::manual();
        let tree = new_tree(&epochs);

        tree.insert_unique(&key, value).unwrap();
        prop_assert_eq!(tree.lookup(&key), Some(value));
        prop_assert_eq!(tree.len(), 1);
    }

    /// A second insert of the same key reports the first value and changes
    /// nothing.
    #[test]
    fn duplicate_insert_keeps_first_value(key in valid_key(), v1: u64, v2: u64) {
        let epochs = EpochManager::manual();
        let tree = new_tree(&epochs);

        tree.insert_unique(&key, v1).unwrap();
        let err = tree.insert_unique(&key, v2).unwrap_err();

        prop_assert!(matches!(err, InsertError::Duplicate(existing) if existing == v1));
        prop_assert_eq!(tree.lookup(&key), Some(v1));
        prop_assert_eq!(tree.len(), 1);
    }

    /// Lookup of a key never inserted finds nothing.
    #[test]
    fn lookup_missing_returns_none(inserted in valid_key(), missing in valid_key(), value: u64) {
        prop_assume!(inserted != missing);

        let epochs = EpochManager::manual();
        let tree = new_tree(&epochs);
        tree.insert_unique(&inserted, value).unwrap();

        prop_assert_eq!(tree.lookup(&missing), None);
    }

    /// Keys over the limit are rejected before touching the tree.
    #[test]
    fn oversized_key_rejected(extra in 1usize..64, value: u64) {
        let epochs = EpochManager::manual();
        let tree = new_tree(&epochs);
        let key: Vec<u8> = vec![0xAB; MAX_KEY_SIZE + extra];

        let err = tree.insert_unique(&key, value).unwrap_err();
        let is_key_too_large = matches!(err, InsertError::KeyTooLarge { len, max } if len == key.len() && max == MAX_KEY_SIZE);
        prop_assert!(is_key_too_large);
        prop_assert!(tree.is_empty());
    }
}

// ============================================================================
//  Differential Testing Against BTreeMap
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Random operation sequences match a first-insert-wins `BTreeMap`.
    #[test]
    fn differential_random_ops(ops in operations(300)) {
        let epochs = EpochManager::manual();
        let tree = new_tree(&epochs);
        let mut oracle: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key, value) => {
                    let result = tree.insert_unique(&key, value);
                    match oracle.entry(key.clone()) {
                        Entry::Vacant(slot) => {
                            prop_assert!(result.is_ok(), "insert of new key {:?} failed", key);
                            slot.insert(value);
                        }
                        Entry::Occupied(slot) => {
                            let matches_oracle = matches!(result, Err(InsertError::Duplicate(v)) if v == *slot.get());
                            prop_assert!(matches_oracle, "duplicate {:?} not reported", key);
                        }
                    }
                }

                Op::Lookup(key) => {
                    prop_assert_eq!(tree.lookup(&key), oracle.get(&key).copied());
                }
            }
        }

        prop_assert_eq!(tree.len(), oracle.len());
        for (key, expected) in &oracle {
            prop_assert_eq!(tree.lookup(key), Some(*expected), "key {:?} lost", key);
        }
    }

    /// Wide keys force many leaf and inner splits. Every key survives them.
    #[test]
    fn differential_wide_keys(keys in prop::collection::hash_set(wide_key(), 0..400)) {
        let epochs = EpochManager::manual();
        let tree = new_tree(&epochs);

        for (i, key) in keys.iter().enumerate() {
            tree.insert_unique(key, i as u64).unwrap();
        }

        prop_assert_eq!(tree.len(), keys.len());
        for (i, key) in keys.iter().enumerate() {
            prop_assert_eq!(tree.lookup(key), Some(i as u64));
        }
        if keys.len() > 64 {
            prop_assert!(tree.height() > 1);
            prop_assert!(tree.stats().leaf_splits > 0);
        }
    }

    /// Drained values come back in key order, and the tree is empty after.
    #[test]
    fn drain_returns_values_in_key_order(keys in prop::collection::btree_set(valid_key(), 0..300)) {
        let epochs = EpochManager::manual();
        let mut tree = new_tree(&epochs);

        // Value = rank in key order, inserted in reverse.
        for (rank, key) in keys.iter().enumerate().rev() {
            tree.insert_unique(key, rank as u64).unwrap();
        }

        let drained: Vec<u64> = tree.drain_values();
        let expected: Vec<u64> = (0..keys.len() as u64).collect();
        prop_assert_eq!(drained, expected);
        prop_assert!(tree.is_empty());
        prop_assert_eq!(tree.height(), 1);
    }
}
