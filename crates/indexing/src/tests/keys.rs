use proptest::prelude::*;

use crate::key::Key;

#[test]
fn test_round_trip_assorted_lengths() {
    for len in [1usize, 3, 7, 8, 9, 15, 16, 17, 40] {
        let bytes: Vec<u8> = (0..len).map(|i| (i * 7 + 13) as u8).collect();
        let key = Key::from_bytes(&bytes);
        assert_eq!(key.to_bytes(), bytes, "length {len}");
        assert_eq!(key.len(), len);
    }
}

#[test]
fn test_slicing() {
    let mut key = Key::from_bytes(b"0123456789");
    assert_eq!(key.slices.len(), 2);
    assert_eq!(key.last_slice_size, 2);
    let first = key.current_slice();
    assert_eq!(first.size, 8);
    assert_eq!(first.slice, u64::from_be_bytes(*b"01234567"));
    assert!(key.has_next());
    key.next();
    let second = key.current_slice();
    assert_eq!(second.size, 2);
    assert_eq!(second.slice, u64::from_be_bytes([b'8', b'9', 0, 0, 0, 0, 0, 0]));
    assert!(!key.has_next());
    key.reset();
    assert_eq!(key.cursor, 0);
}

#[test]
fn test_order_agrees_with_bytes() {
    // A prefix sorts before its extension even across the slice boundary,
    // and embedded zero bytes still order correctly.
    let cases: &[(&[u8], &[u8])] = &[
        (b"a", b"b"),
        (b"a", b"aa"),
        (b"aaaaaaaa", b"aaaaaaaaa"),
        (b"aaaaaaa", b"aaaaaaaa"),
        (b"abc", b"abc\x00"),
        (b"abc\x00", b"abd"),
        (b"aaaaaaaab", b"aaaaaaab"),
    ];
    for (lo, hi) in cases {
        let lo_key = Key::from_bytes(lo);
        let hi_key = Key::from_bytes(hi);
        assert!(lo_key < hi_key, "{lo:?} < {hi:?}");
        assert!(hi_key > lo_key);
    }
}

#[test]
fn test_cursor_does_not_affect_equality() {
    let a = Key::from_bytes(b"0123456789abcdef0");
    let mut b = Key::from_bytes(b"0123456789abcdef0");
    b.next();
    assert_eq!(a, b);
}

#[test]
fn test_remain_length() {
    let key = Key::from_bytes(b"0123456789abcdef012");
    assert_eq!(key.remain_length(0), 19);
    assert_eq!(key.remain_length(1), 11);
    assert_eq!(key.remain_length(2), 3);
}

proptest! {
    #[test]
    fn proptest_round_trip(bytes in proptest::collection::vec(any::<u8>(), 1..64)) {
        let key = Key::from_bytes(&bytes);
        prop_assert_eq!(key.to_bytes(), bytes);
    }

    #[test]
    fn proptest_order_matches_byte_order(
        a in proptest::collection::vec(any::<u8>(), 1..48),
        b in proptest::collection::vec(any::<u8>(), 1..48),
    ) {
        let key_a = Key::from_bytes(&a);
        let key_b = Key::from_bytes(&b);
        prop_assert_eq!(key_a.cmp(&key_b), a.cmp(&b));
    }
}
