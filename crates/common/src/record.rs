use std::sync::atomic::{
    AtomicU64,
    Ordering,
};

use parking_lot::Mutex;

use crate::tid::TidWord;

/// A record: an opaque byte-string body plus its TID word.
///
/// The TID word is the concurrency-control handle: writers set the lock bit
/// before touching the body and release-store a new word afterwards; readers
/// copy the body and re-check the word. The body itself sits behind a plain
/// mutex, held only for the copy or the overwrite.
pub struct Record {
    tid: AtomicU64,
    body: Mutex<Vec<u8>>,
}

impl Record {
    /// A record created by an in-flight insert: absent until commit.
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            tid: AtomicU64::new(TidWord::absent_initial().raw()),
            body: Mutex::new(body),
        }
    }

    /// A record installed with a known TID word (recovery replay).
    pub fn with_tid(body: Vec<u8>, tid: TidWord) -> Self {
        Self {
            tid: AtomicU64::new(tid.raw()),
            body: Mutex::new(body),
        }
    }

    pub fn load_tid(&self) -> TidWord {
        TidWord::from_raw(self.tid.load(Ordering::Acquire))
    }

    pub fn store_tid(&self, word: TidWord) {
        self.tid.store(word.raw(), Ordering::Release);
    }

    /// CAS on the TID word; returns the observed word on failure.
    pub fn cas_tid(&self, expected: TidWord, desired: TidWord) -> Result<(), TidWord> {
        self.tid
            .compare_exchange(
                expected.raw(),
                desired.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(TidWord::from_raw)
    }

    pub fn read_body(&self) -> Vec<u8> {
        self.body.lock().clone()
    }

    /// Only the committing writer, holding the TID lock bit, calls this.
    pub fn set_body(&self, body: Vec<u8>) {
        *self.body.lock() = body;
    }
}

#[cfg(test)]
mod tests {
    use super::Record;
    use crate::tid::TidWord;

    #[test]
    fn test_new_record_is_absent() {
        let record = Record::new(b"v1".to_vec());
        assert!(record.load_tid().absent());
        assert!(!record.load_tid().lock());
        assert_eq!(record.read_body(), b"v1");
    }

    #[test]
    fn test_cas_reports_observed_word() {
        let record = Record::new(Vec::new());
        let current = record.load_tid();
        let stale = current.with_tid(42);
        let desired = current.with_lock(true);
        let observed = record.cas_tid(stale, desired).unwrap_err();
        assert_eq!(observed, current);
        record.cas_tid(current, desired).unwrap();
        assert!(record.load_tid().lock());
    }

    #[test]
    fn test_with_tid_installs_word() {
        let word = TidWord::new().with_epoch(3).with_tid(7);
        let record = Record::with_tid(b"x".to_vec(), word);
        assert_eq!(record.load_tid(), word);
    }
}
