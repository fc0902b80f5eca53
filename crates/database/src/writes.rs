//! Write-set tracking for an active transaction.

use common::Record;
use durability::OpType;
use indexing::Key;

/// One pending mutation: the key, the record it applies to, and the body
/// to install. INSERTs own their record until commit; aborts undo them.
pub struct WriteElement {
    pub key: Key,
    pub record: *const Record,
    pub new_body: Vec<u8>,
    pub op: OpType,
}

#[derive(Default)]
pub struct WriteSet {
    elements: Vec<WriteElement>,
}

// Same justification as `ReadSet`.
unsafe impl Send for WriteSet {}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, element: WriteElement) {
        self.elements.push(element);
    }

    pub fn search(&self, key: &Key) -> Option<&WriteElement> {
        self.elements.iter().find(|element| element.key == *key)
    }

    pub fn search_mut(&mut self, key: &Key) -> Option<&mut WriteElement> {
        self.elements.iter_mut().find(|element| element.key == *key)
    }

    /// Lock acquisition order: keys ascending, so concurrent validators
    /// never deadlock.
    pub fn sort_by_key(&mut self) {
        self.elements.sort_by(|a, b| a.key.cmp(&b.key));
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteElement> {
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

    pub fn drain(&mut self) -> std::vec::Drain<'_, WriteElement> {
        self.elements.drain(..)
    }
}
