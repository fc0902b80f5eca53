use std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    thread,
};

use common::Record;

use crate::{
    gc::GarbageCollector,
    key::Key,
    tests::{
        get_body,
        put,
    },
    Masstree,
};

#[test]
fn test_disjoint_concurrent_inserts() {
    let tree = Arc::new(Masstree::new());
    let threads = 4;
    let per_thread = 250;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut gc = GarbageCollector::new();
                for i in 0..per_thread {
                    let key = format!("t{t}-key{i:05}");
                    assert!(put(&tree, &key, &format!("{t}:{i}"), &mut gc));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..threads {
        for i in 0..per_thread {
            let key = format!("t{t}-key{i:05}");
            assert_eq!(
                get_body(&tree, &key).unwrap(),
                format!("{t}:{i}").into_bytes(),
                "{key}"
            );
        }
    }
}

#[test]
fn test_conflicting_inserts_single_winner() {
    let tree = Arc::new(Masstree::new());
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                let mut gc = GarbageCollector::new();
                if put(&tree, "contested", "won", &mut gc) {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(get_body(&tree, "contested").unwrap(), b"won");
}

#[test]
fn test_readers_during_inserts() {
    let tree = Arc::new(Masstree::new());
    let mut seed_gc = GarbageCollector::new();
    for i in 0..100 {
        assert!(put(&tree, &format!("stable{i:03}"), "seed", &mut seed_gc));
    }

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            let mut gc = GarbageCollector::new();
            for i in 0..1000 {
                assert!(put(&tree, &format!("hot{i:05}"), "w", &mut gc));
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for _ in 0..200 {
                    for i in (0..100).step_by(7) {
                        let key = format!("stable{i:03}");
                        let mut probe = Key::from_bytes(key.as_bytes());
                        let record: &Record =
                            tree.get(&mut probe).expect("seeded key must stay visible");
                        assert_eq!(record.read_body(), b"seed");
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(get_body(&tree, "hot00999").unwrap(), b"w");
}

#[test]
fn test_concurrent_disjoint_removals() {
    let tree = Arc::new(Masstree::new());
    let mut seed_gc = GarbageCollector::new();
    let threads = 4;
    let per_thread = 120;
    for t in 0..threads {
        for i in 0..per_thread {
            assert!(put(&tree, &format!("rm{t}-{i:04}"), "v", &mut seed_gc));
        }
    }

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut gc = GarbageCollector::new();
                for i in 0..per_thread {
                    let key = format!("rm{t}-{i:04}");
                    let mut probe = Key::from_bytes(key.as_bytes());
                    let record = tree.get(&mut probe).expect("seeded") as *const Record;
                    let mut key = Key::from_bytes(key.as_bytes());
                    assert!(tree.remove(&mut key, &mut gc).is_ok());
                    gc.add_record(record);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..threads {
        for i in 0..per_thread {
            assert_eq!(get_body(&tree, &format!("rm{t}-{i:04}")), None);
        }
    }
    assert!(tree.is_empty());
}

#[test]
fn test_concurrent_scans_and_inserts() {
    let tree = Arc::new(Masstree::new());
    let mut seed_gc = GarbageCollector::new();
    for i in 0..50 {
        assert!(put(&tree, &format!("fixed{i:02}"), "v", &mut seed_gc));
    }

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            let mut gc = GarbageCollector::new();
            for i in 0..300 {
                assert!(put(&tree, &format!("growing{i:04}"), "v", &mut gc));
            }
        })
    };
    let scanner = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            let left = Key::from_bytes(b"fixed00");
            let right = Key::from_bytes(b"fixed49");
            for _ in 0..100 {
                let mut out = Vec::new();
                tree.scan(&left, false, &right, false, &mut out);
                // The fixed range never changes, so every scan sees it all.
                assert_eq!(out.len(), 50);
            }
        })
    };
    writer.join().unwrap();
    scanner.join().unwrap();
}
