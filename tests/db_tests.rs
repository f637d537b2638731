//! End-to-end scenarios for the database facade.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use olckv::{Database, Error, Options, Status};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
//  Scenarios
// ============================================================================

#[test]
fn put_get_overwrite() {
    common::init_tracing();
    let db = Database::open("put-get");

    db.put(b"abc", b"123").unwrap();
    assert_eq!(db.get(b"abc").unwrap(), "123");

    db.put(b"abc", b"234").unwrap();
    assert_eq!(db.get(b"abc").unwrap(), "234");

    let missing = db.get(b"not_key");
    assert_eq!(missing, Err(Error::KeyNotExist));
    assert_eq!(Status::of(&missing), Some(Status::KeyNotExist));

    db.close();
}

#[test]
fn second_writer_fails_until_first_commits() {
    common::init_tracing();
    let db = Database::open("first-writer-wins");

    let mut first = db.begin_write();
    let mut second = db.begin_write();
    assert_eq!(first.timestamp(), second.timestamp());

    first.put(b"key", b"first").unwrap();

    let conflict = second.put(b"key", b"second");
    assert_eq!(conflict, Err(Error::FailByActiveTxn));
    assert_eq!(Status::of(&conflict), Some(Status::FailByActiveTxn));

    first.commit();

    assert_eq!(second.get(b"key").unwrap(), "first");
    second.put(b"key", b"second").unwrap();
    assert_eq!(second.get(b"key").unwrap(), "second");
    second.commit();

    assert_eq!(db.get(b"key").unwrap(), "second");
}

#[test]
fn shuffled_keys_all_found() {
    common::init_tracing();
    let db = Database::open("shuffled");
    let keys: Vec<Vec<u8>> = common::shuffled_keys(1..100_000, 0xC0FFEE);

    for key in &keys {
        db.put(key, key).unwrap();
        assert_eq!(db.get(key).unwrap(), key.as_slice());
    }

    for n in 1..100_000u64 {
        let key: Vec<u8> = n.to_string().into_bytes();
        assert_eq!(db.get(&key).unwrap(), key.as_slice(), "key {n} lost");
    }
    assert_eq!(db.get(b"100000"), Err(Error::KeyNotExist));
    assert_eq!(db.len(), 99_999);

    let stats = db.stats();
    assert!(stats.tree.leaf_splits > 0);
    assert_eq!(stats.txns.aborted, 0);
}

#[test]
fn reader_snapshot_survives_commits() {
    common::init_tracing();
    let db = Database::open("snapshot");
    db.put(b"k", b"v1").unwrap();

    let mut reader = db.begin_read();
    db.put(b"k", b"v2").unwrap();
    db.delete(b"k").unwrap();
    db.put(b"new", b"x").unwrap();

    assert_eq!(reader.get(b"k").unwrap(), "v1");
    // Created after the snapshot: its only version is too new.
    assert_eq!(reader.get(b"new"), Err(Error::KeyNotExist));
    reader.commit();

    assert_eq!(db.get(b"k"), Err(Error::KeyNotExist));
    assert_eq!(db.get(b"new").unwrap(), "x");
}

#[test]
fn reader_never_blocks_on_writer() {
    common::init_tracing();
    let db = Database::open("no-block");
    db.put(b"k", b"committed").unwrap();

    let mut writer = db.begin_write();
    writer.put(b"k", b"pending").unwrap();

    // A single-call get runs as a snapshot reader.
    assert_eq!(db.get(b"k").unwrap(), "committed");
    writer.abort();
    assert_eq!(db.get(b"k").unwrap(), "committed");
}

#[test]
fn abort_restores_previous_state() {
    common::init_tracing();
    let db = Database::open("abort");
    db.put(b"a", b"1").unwrap();

    let mut txn = db.begin_write();
    txn.put(b"a", b"2").unwrap();
    txn.put(b"b", b"2").unwrap();
    txn.delete(b"a").unwrap();
    assert_eq!(txn.get(b"a"), Err(Error::KeyNotExist));
    txn.abort();

    assert_eq!(db.get(b"a").unwrap(), "1");
    assert_eq!(db.get(b"b"), Err(Error::KeyNotExist));

    // Latches were released: a new writer gets through.
    db.put(b"a", b"3").unwrap();
    db.put(b"b", b"3").unwrap();
    assert_eq!(db.get(b"a").unwrap(), "3");
}

#[test]
fn dropped_transaction_rolls_back() {
    common::init_tracing();
    let db = Database::open("drop");

    {
        let mut txn = db.begin_write();
        txn.put(b"k", b"v").unwrap();
    }

    assert_eq!(db.get(b"k"), Err(Error::KeyNotExist));
    assert_eq!(db.stats().txns.aborted, 1);
    db.put(b"k", b"v").unwrap();
}

#[test]
fn background_reclaimer_frees_pruned_versions() {
    common::init_tracing();
    let db = Database::open_with(
        "reclaim",
        Options::default().epoch_interval(Duration::from_millis(1)),
    );

    for i in 0..200u32 {
        db.put(b"hot", i.to_string().as_bytes()).unwrap();
    }
    assert!(db.stats().txns.pruned > 0);

    // Give the ticker a few intervals.
    for _ in 0..200 {
        if db.stats().epochs.reclaimed >= db.stats().txns.pruned {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(db.stats().epochs.reclaimed, db.stats().txns.pruned);
    assert_eq!(db.get(b"hot").unwrap(), "199");
}

// ============================================================================
//  Differential Testing Against BTreeMap
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Get(Vec<u8>),
    Delete(Vec<u8>),
}

fn small_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(b'a'..=b'h', 1..=3)
}

fn operations() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (small_key(), prop::collection::vec(any::<u8>(), 0..32)).prop_map(|(k, v)| Op::Put(k, v)),
            3 => small_key().prop_map(Op::Get),
            1 => small_key().prop_map(Op::Delete),
        ],
        0..200,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Single-call operations behave like a map with tombstones.
    #[test]
    fn differential_single_calls(ops in operations()) {
        let db = Database::open("differential");
        let mut oracle: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Put(key, value) => {
                    prop_assert!(db.put(&key, &value).is_ok());
                    oracle.insert(key, value);
                }
                Op::Get(key) => {
                    let expected = oracle.get(&key).cloned().ok_or(Error::KeyNotExist);
                    prop_assert_eq!(db.get(&key).map(|v| v.to_vec()), expected);
                }
                Op::Delete(key) => {
                    let expected = oracle.remove(&key).map(|_| ()).ok_or(Error::KeyNotExist);
                    prop_assert_eq!(db.delete(&key), expected);
                }
            }
        }

        for (key, value) in &oracle {
            prop_assert_eq!(db.get(key).unwrap(), value.as_slice());
        }
    }

    /// A transaction sees its own writes, and nobody else does until commit.
    #[test]
    fn differential_one_transaction(ops in operations(), commit: bool) {
        let db = Database::open("differential-txn");
        let mut oracle: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        let mut txn = db.begin_write();
        for op in ops {
            match op {
                Op::Put(key, value) => {
                    prop_assert!(txn.put(&key, &value).is_ok());
                    oracle.insert(key, value);
                }
                Op::Get(key) => {
                    let expected = oracle.get(&key).cloned().ok_or(Error::KeyNotExist);
                    prop_assert_eq!(txn.get(&key).map(|v| v.to_vec()), expected);
                }
                Op::Delete(key) => {
                    let expected = oracle.remove(&key).map(|_| ()).ok_or(Error::KeyNotExist);
                    prop_assert_eq!(txn.delete(&key), expected);
                }
            }
            // Outside readers see nothing yet.
            prop_assert!(oracle.keys().all(|k| db.get(k) == Err(Error::KeyNotExist)));
        }

        if commit {
            txn.commit();
            for (key, value) in &oracle {
                prop_assert_eq!(db.get(key).unwrap(), value.as_slice());
            }
        } else {
            txn.abort();
            prop_assert!(oracle.keys().all(|k| db.get(k) == Err(Error::KeyNotExist)));
        }
    }
}
