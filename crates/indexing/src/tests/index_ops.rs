use common::Status;

use crate::{
    gc::GarbageCollector,
    key::Key,
    tests::{
        del,
        get_body,
        put,
    },
    Masstree,
};

#[test]
fn test_single_key_lifecycle() {
    let tree = Masstree::new();
    let mut gc = GarbageCollector::new();

    assert!(put(&tree, "k", "v1", &mut gc));
    assert_eq!(get_body(&tree, "k").unwrap(), b"v1");
    assert!(!put(&tree, "k", "v2", &mut gc));
    assert!(del(&tree, "k", &mut gc));
    assert_eq!(get_body(&tree, "k"), None);
    assert!(tree.is_empty());
    gc.reclaim_all();
}

#[test]
fn test_keys_longer_than_one_slice() {
    let tree = Masstree::new();
    let mut gc = GarbageCollector::new();

    // 4, 9, and 17 byte keys sharing 8-byte prefixes force suffixes and
    // layer creation.
    assert!(put(&tree, "pref", "short", &mut gc));
    assert!(put(&tree, "prefixAAx", "nine", &mut gc));
    assert!(put(&tree, "prefixAAxxxxxxxxy", "seventeen", &mut gc));
    assert!(put(&tree, "prefixAAxxxxxxxxz", "other", &mut gc));

    assert_eq!(get_body(&tree, "pref").unwrap(), b"short");
    assert_eq!(get_body(&tree, "prefixAAx").unwrap(), b"nine");
    assert_eq!(get_body(&tree, "prefixAAxxxxxxxxy").unwrap(), b"seventeen");
    assert_eq!(get_body(&tree, "prefixAAxxxxxxxxz").unwrap(), b"other");
    assert_eq!(get_body(&tree, "prefixAA"), None);
    assert_eq!(get_body(&tree, "prefixAAxxxxxxxx"), None);
}

#[test]
fn test_duplicate_insert_in_layer() {
    let tree = Masstree::new();
    let mut gc = GarbageCollector::new();
    assert!(put(&tree, "0123456789abcdef0", "v", &mut gc));
    assert!(!put(&tree, "0123456789abcdef0", "w", &mut gc));
    assert_eq!(get_body(&tree, "0123456789abcdef0").unwrap(), b"v");
}

#[test]
fn test_many_keys_force_splits() {
    let tree = Masstree::new();
    let mut gc = GarbageCollector::new();
    let keys: Vec<String> = (0..500).map(|i| format!("key{i:05}")).collect();
    for (i, key) in keys.iter().enumerate() {
        assert!(put(&tree, key, &format!("value{i}"), &mut gc), "{key}");
    }
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(
            get_body(&tree, key).unwrap(),
            format!("value{i}").into_bytes(),
            "{key}"
        );
    }
}

#[test]
fn test_remove_everything_then_reinsert() {
    let tree = Masstree::new();
    let mut gc = GarbageCollector::new();
    let keys: Vec<String> = (0..120).map(|i| format!("k{i:04}")).collect();
    for key in &keys {
        assert!(put(&tree, key, "x", &mut gc));
    }
    for key in &keys {
        assert!(del(&tree, key, &mut gc), "{key}");
    }
    for key in &keys {
        assert_eq!(get_body(&tree, key), None);
    }
    assert!(tree.is_empty());
    for key in &keys {
        assert!(put(&tree, key, "y", &mut gc), "{key}");
    }
    assert_eq!(get_body(&tree, "k0000").unwrap(), b"y");
    gc.reclaim_all();
}

#[test]
fn test_removed_slot_reuse() {
    let tree = Masstree::new();
    let mut gc = GarbageCollector::new();
    for key in ["a", "b", "c"] {
        assert!(put(&tree, key, "1", &mut gc));
    }
    assert!(del(&tree, "b", &mut gc));
    assert!(put(&tree, "b", "2", &mut gc));
    assert_eq!(get_body(&tree, "b").unwrap(), b"2");
    assert_eq!(get_body(&tree, "a").unwrap(), b"1");
    assert_eq!(get_body(&tree, "c").unwrap(), b"1");
}

#[test]
fn test_layer_collapse_on_remove() {
    let tree = Masstree::new();
    let mut gc = GarbageCollector::new();
    // Two keys sharing a long prefix create a layer; removing one collapses
    // it back into a suffix.
    assert!(put(&tree, "0123456789abcdefAAA", "first", &mut gc));
    assert!(put(&tree, "0123456789abcdefBBB", "second", &mut gc));
    assert!(del(&tree, "0123456789abcdefAAA", &mut gc));
    assert_eq!(get_body(&tree, "0123456789abcdefBBB").unwrap(), b"second");
    assert_eq!(get_body(&tree, "0123456789abcdefAAA"), None);
    assert!(del(&tree, "0123456789abcdefBBB", &mut gc));
    assert!(tree.is_empty());
    gc.reclaim_all();
}

fn scan_keys(
    tree: &Masstree,
    left: &str,
    l_exclusive: bool,
    right: &str,
    r_exclusive: bool,
) -> Vec<String> {
    let left = Key::from_bytes(left.as_bytes());
    let right = Key::from_bytes(right.as_bytes());
    let mut out = Vec::new();
    assert_eq!(
        tree.scan(&left, l_exclusive, &right, r_exclusive, &mut out),
        Status::Ok
    );
    out.iter()
        .map(|(key, _)| String::from_utf8(key.to_bytes()).unwrap())
        .collect()
}

#[test]
fn test_scan_is_ordered_and_bounded() {
    let tree = Masstree::new();
    let mut gc = GarbageCollector::new();
    let keys: Vec<String> = (0..100).map(|i| format!("scan{i:03}")).collect();
    for key in &keys {
        assert!(put(&tree, key, "v", &mut gc));
    }

    let all = scan_keys(&tree, "scan000", false, "scan099", false);
    assert_eq!(all, keys);

    let inner = scan_keys(&tree, "scan010", true, "scan013", true);
    assert_eq!(inner, vec!["scan011", "scan012"]);

    let from_mid = scan_keys(&tree, "scan095", false, "zzzz", false);
    assert_eq!(
        from_mid,
        vec!["scan095", "scan096", "scan097", "scan098", "scan099"]
    );
}

#[test]
fn test_scan_across_layers_and_suffixes() {
    let tree = Masstree::new();
    let mut gc = GarbageCollector::new();
    // Lengths 4, 9, and 17 sharing common prefixes, inserted out of order.
    let mut keys = vec![
        "aaaa".to_string(),
        "aaab".to_string(),
        "aaaaxxxx2".to_string(),
        "aaaaxxxx1".to_string(),
        "aaaaxxxxyyyyyyyy2".to_string(),
        "aaaaxxxxyyyyyyyy1".to_string(),
        "zzzz".to_string(),
    ];
    for key in &keys {
        assert!(put(&tree, key, "v", &mut gc));
    }
    keys.sort();

    let found = scan_keys(&tree, "aaaa", false, "zzzzzzzzzzzzzzzzz", false);
    assert_eq!(found, keys);

    // Exclusive left bound drops the exact match only.
    let found = scan_keys(&tree, "aaaa", true, "zzzzzzzzzzzzzzzzz", false);
    assert_eq!(found, keys[1..].to_vec());
}

#[test]
fn test_scan_empty_tree() {
    let tree = Masstree::new();
    assert!(scan_keys(&tree, "a", false, "z", false).is_empty());
}

mod model {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use crate::{
        gc::GarbageCollector,
        key::Key,
        Masstree,
    };

    /// One random workload step.
    #[derive(Debug, Clone)]
    enum Op {
        Put(Vec<u8>, Vec<u8>),
        Del(Vec<u8>),
    }

    fn arb_key() -> impl Strategy<Value = Vec<u8>> {
        // Small alphabet and varied lengths force shared slices, suffixes,
        // and layer traffic.
        proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), any::<u8>()], 1..24)
    }

    fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
        proptest::collection::vec(
            prop_oneof![
                (arb_key(), proptest::collection::vec(any::<u8>(), 0..8))
                    .prop_map(|(key, val)| Op::Put(key, val)),
                arb_key().prop_map(Op::Del),
            ],
            1..60,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// The index agrees with a `BTreeMap` under random inserts and
        /// removes: point lookups and full ordered scans.
        #[test]
        fn proptest_matches_btreemap(ops in arb_ops()) {
            let tree = Masstree::new();
            let mut gc = GarbageCollector::new();
            let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

            for op in &ops {
                match op {
                    Op::Put(key_bytes, val) => {
                        let record = Box::into_raw(Box::new(common::Record::new(val.clone())));
                        let mut key = Key::from_bytes(key_bytes);
                        if tree.insert(&mut key, record, &mut gc).is_ok() {
                            model.insert(key_bytes.clone(), val.clone());
                        } else {
                            drop(unsafe { Box::from_raw(record) });
                        }
                    },
                    Op::Del(key_bytes) => {
                        let mut probe = Key::from_bytes(key_bytes);
                        let record = tree.get(&mut probe).map(|r| r as *const common::Record);
                        let mut key = Key::from_bytes(key_bytes);
                        if tree.remove(&mut key, &mut gc).is_ok() {
                            if let Some(record) = record {
                                gc.add_record(record);
                            }
                            model.remove(key_bytes);
                        }
                    },
                }
            }

            // Point lookups agree.
            for op in &ops {
                let key_bytes = match op {
                    Op::Put(key, _) | Op::Del(key) => key,
                };
                let mut key = Key::from_bytes(key_bytes);
                let found = tree.get(&mut key).map(|record| record.read_body());
                prop_assert_eq!(&found, &model.get(key_bytes).cloned());
            }

            // A full scan agrees, in order.
            let left = Key::from_bytes(&[0x00]);
            let right = Key::from_bytes(&[0xFF; 25]);
            let mut out = Vec::new();
            tree.scan(&left, false, &right, false, &mut out);
            let scanned: Vec<(Vec<u8>, Vec<u8>)> = out
                .into_iter()
                .map(|(key, record)| (key.to_bytes(), record.read_body()))
                .collect();
            let expected: Vec<(Vec<u8>, Vec<u8>)> =
                model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            prop_assert_eq!(scanned, expected);
        }
    }
}

#[test]
fn test_gc_defers_reclamation() {
    let tree = Masstree::new();
    let mut gc = GarbageCollector::new();
    gc.set_epoch(5);
    assert!(put(&tree, "gc-key", "v", &mut gc));
    assert!(del(&tree, "gc-key", &mut gc));
    let pending = gc.len();
    assert!(pending > 0);
    // Too young to free at epoch 6, old enough at 7.
    gc.reclaim(6);
    assert_eq!(gc.len(), pending);
    gc.reclaim(7);
    assert_eq!(gc.len(), 0);
}
