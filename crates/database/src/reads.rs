//! Read-set tracking for an active transaction.

use common::{
    Record,
    TidWord,
};
use indexing::Key;

/// One observed record: the key, the record it resolved to, and the TID
/// word seen at read time. Validation reloads the word and aborts on any
/// difference.
pub struct ReadElement {
    pub key: Key,
    pub record: *const Record,
    pub observed: TidWord,
    pub body: Vec<u8>,
}

#[derive(Default)]
pub struct ReadSet {
    elements: Vec<ReadElement>,
}

// Record pointers stay valid under the epoch-deferred reclamation rule;
// the set itself lives on its worker thread.
unsafe impl Send for ReadSet {}

impl ReadSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, element: ReadElement) {
        self.elements.push(element);
    }

    pub fn search(&self, key: &Key) -> Option<&ReadElement> {
        self.elements.iter().find(|element| element.key == *key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadElement> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }
}
