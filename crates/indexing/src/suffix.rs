use crate::key::{
    Key,
    KeySlice,
};

/// Storage for the bytes of a key beyond the 8-byte slice a border node
/// indexes. Suffixes are immutable once published in a node slot; layer
/// moves build a new suffix and garbage-list the old one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BigSuffix {
    slices: Vec<u64>,
    last_slice_size: u8,
}

impl BigSuffix {
    pub fn new(slices: Vec<u64>, last_slice_size: u8) -> Self {
        debug_assert!(!slices.is_empty());
        debug_assert!((1..=8).contains(&last_slice_size));
        Self {
            slices,
            last_slice_size,
        }
    }

    /// The suffix of `key` starting at slice index `from`.
    pub fn from_key(key: &Key, from: usize) -> Self {
        Self::new(key.slices[from..].to_vec(), key.last_slice_size)
    }

    /// A single-slice suffix, used when a layer collapse relocates a short
    /// key upward.
    pub fn single(slice: u64, size: u8) -> Self {
        Self::new(vec![slice], size)
    }

    pub fn slices(&self) -> &[u64] {
        &self.slices
    }

    pub fn last_slice_size(&self) -> u8 {
        self.last_slice_size
    }

    pub fn has_next(&self) -> bool {
        self.slices.len() >= 2
    }

    pub fn first_slice(&self) -> KeySlice {
        KeySlice {
            slice: self.slices[0],
            size: if self.has_next() {
                8
            } else {
                self.last_slice_size
            },
        }
    }

    /// Everything after the first slice; the caller checked [`Self::has_next`].
    #[must_use]
    pub fn without_first(&self) -> Self {
        debug_assert!(self.has_next());
        Self::new(self.slices[1..].to_vec(), self.last_slice_size)
    }

    /// The suffix extended with `slice` in front, used when relocating a key
    /// one layer up.
    #[must_use]
    pub fn with_front(&self, slice: u64) -> Self {
        let mut slices = Vec::with_capacity(self.slices.len() + 1);
        slices.push(slice);
        slices.extend_from_slice(&self.slices);
        Self::new(slices, self.last_slice_size)
    }

    pub fn remain_length(&self) -> usize {
        (self.slices.len() - 1) * 8 + self.last_slice_size as usize
    }

    /// Whether this suffix spells exactly the tail of `key` from slice index
    /// `from` onward.
    pub fn matches(&self, key: &Key, from: usize) -> bool {
        if key.remain_length(from) != self.remain_length() {
            return false;
        }
        self.slices
            .iter()
            .zip(&key.slices[from..])
            .all(|(a, b)| a == b)
    }
}

#[cfg(test)]
mod tests {
    use super::BigSuffix;
    use crate::key::Key;

    #[test]
    fn test_matches_tail() {
        let key = Key::from_bytes(b"0123456789abcdef012");
        let suffix = BigSuffix::from_key(&key, 1);
        assert!(suffix.matches(&key, 1));
        assert!(!suffix.matches(&key, 0));
        assert_eq!(suffix.remain_length(), key.len() - 8);
    }

    #[test]
    fn test_front_round_trip() {
        let key = Key::from_bytes(b"0123456789abcdef012");
        let suffix = BigSuffix::from_key(&key, 1);
        let front = suffix.first_slice();
        assert!(suffix.has_next());
        let rest = suffix.without_first();
        assert_eq!(rest.with_front(front.slice), suffix);
    }
}
