mod concurrent;
mod index_ops;
mod keys;

use common::Record;

use crate::{
    gc::GarbageCollector,
    key::Key,
    Masstree,
};

/// Insert helper: allocates the record the way the transaction layer does
/// and reclaims it if the key already exists.
pub(crate) fn put(tree: &Masstree, key: &str, value: &str, gc: &mut GarbageCollector) -> bool {
    let record = Box::into_raw(Box::new(Record::new(value.as_bytes().to_vec())));
    let mut key = Key::from_bytes(key.as_bytes());
    if tree.insert(&mut key, record, gc).is_ok() {
        true
    } else {
        drop(unsafe { Box::from_raw(record) });
        false
    }
}

pub(crate) fn get_body(tree: &Masstree, key: &str) -> Option<Vec<u8>> {
    let mut key = Key::from_bytes(key.as_bytes());
    tree.get(&mut key).map(|record| record.read_body())
}

/// Remove helper matching the executor's reclamation order: unlink from the
/// index first, then garbage-list the record.
pub(crate) fn del(tree: &Masstree, key: &str, gc: &mut GarbageCollector) -> bool {
    let mut probe = Key::from_bytes(key.as_bytes());
    let record = match tree.get(&mut probe) {
        Some(record) => record as *const Record,
        None => return false,
    };
    let mut key = Key::from_bytes(key.as_bytes());
    if tree.remove(&mut key, gc).is_ok() {
        gc.add_record(record);
        true
    } else {
        false
    }
}
