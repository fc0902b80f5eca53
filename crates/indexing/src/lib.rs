//! A lock-free ordered index: a trie of B-tree-like nodes keyed on 8-byte
//! key slices, supporting concurrent insert, get, remove, and range scan.
//!
//! Writers take per-node locks and flag their structural changes in each
//! node's version word; readers never lock, they validate their
//! observations against stable versions and retry. Unlinked nodes, records,
//! and suffixes are reclaimed through a per-worker epoch-deferred garbage
//! list.

use std::{
    ptr,
    sync::atomic::{
        AtomicPtr,
        Ordering,
    },
};

use common::{
    backoff::SpinWait,
    Record,
    Status,
};
use parking_lot::Mutex;

pub mod gc;
pub mod key;
pub mod node;
pub mod permutation;
pub mod suffix;
pub mod version;

mod get;
mod insert;
mod remove;
mod scan;

#[cfg(test)]
mod tests;

pub use crate::{
    gc::GarbageCollector,
    key::{
        Key,
        KeySlice,
    },
};
use crate::{
    get::GetOutcome,
    insert::PutResult,
    node::{
        as_border,
        as_interior,
        Node,
        KEY_LEN_HAS_SUFFIX,
        KEY_LEN_LAYER,
        ORDER,
    },
    remove::RemoveResult,
    scan::ScanControl,
};

/// The layered trie. Layer 0 indexes the first 8-byte slice; deeper layers
/// index later slices of keys that share a prefix.
///
/// The tree owns its nodes and the records hung off them. Records handed
/// out by [`Masstree::get`] and [`Masstree::scan`] stay valid as long as
/// the reader keeps refreshing its epoch (unlinked records are freed two
/// global epochs after removal).
pub struct Masstree {
    root: AtomicPtr<Node>,
    // Serializes root-pointer replacement; loads stay lock-free.
    root_lock: Mutex<()>,
}

unsafe impl Send for Masstree {}
unsafe impl Sync for Masstree {}

impl Masstree {
    pub fn new() -> Self {
        Self {
            root: AtomicPtr::new(ptr::null_mut()),
            root_lock: Mutex::new(()),
        }
    }

    /// Point lookup. The returned record may carry the absent bit; the
    /// transaction layer decides what that means.
    pub fn get(&self, key: &mut Key) -> Option<&Record> {
        loop {
            let root = self.root.load(Ordering::Acquire);
            if root.is_null() {
                return None;
            }
            key.reset();
            match unsafe { get::get(root, key) } {
                GetOutcome::Found(record) => return Some(unsafe { &*record }),
                GetOutcome::NotFound => return None,
                // The layer we were in collapsed; the key may now live
                // higher up.
                GetOutcome::RetryFromUpperLayer => continue,
            }
        }
    }

    /// Insert a record. Returns `WarnAlreadyExists` (leaving the caller the
    /// record) if the key is present, installed or not.
    pub fn insert(
        &self,
        key: &mut Key,
        record: *const Record,
        gc: &mut GarbageCollector,
    ) -> Status {
        loop {
            let old_root = self.root.load(Ordering::Acquire);
            key.reset();
            if old_root.is_null() {
                let new_root = unsafe { insert::start_new_tree(key, record) };
                let guard = self.root_lock.lock();
                if self.root.load(Ordering::Acquire).is_null() {
                    self.root
                        .store(unsafe { (*new_root).as_node_ptr() }, Ordering::Release);
                    return Status::Ok;
                }
                // Lost the race for the first tree; discard ours and try
                // again against the winner's.
                drop(guard);
                unsafe { insert::free_unpublished_root(new_root) };
                continue;
            }
            match unsafe { insert::insert(old_root, key, record, gc) } {
                PutResult::Done(new_root) => {
                    if !ptr::eq(new_root, old_root) {
                        let _guard = self.root_lock.lock();
                        self.root.store(new_root, Ordering::Release);
                    }
                    return Status::Ok;
                },
                PutResult::AlreadyExists => return Status::WarnAlreadyExists,
                PutResult::RetryFromUpperLayer => continue,
            }
        }
    }

    /// Remove a key. The record it pointed at is not freed here; the
    /// caller owns it and garbage-lists it once unlinked.
    pub fn remove(&self, key: &mut Key, gc: &mut GarbageCollector) -> Status {
        loop {
            let old_root = self.root.load(Ordering::Acquire);
            if old_root.is_null() {
                return Status::WarnNotFound;
            }
            key.reset();
            match unsafe { remove::remove(old_root, key, gc) } {
                RemoveResult::NotFound => return Status::WarnNotFound,
                RemoveResult::Done => return Status::Ok,
                RemoveResult::NewRoot(new_root) => {
                    let _guard = self.root_lock.lock();
                    debug_assert!(ptr::eq(self.root.load(Ordering::Acquire), old_root));
                    self.root.store(new_root, Ordering::Release);
                    return Status::Ok;
                },
                // Collapsing the top layer re-homes the key; retry sees it.
                RemoveResult::LayerDeleted => continue,
            }
        }
    }

    /// Ordered range scan. Restarts internally whenever a concurrent
    /// structural change invalidates a border mid-read, so the emitted
    /// entries are consistent with a serialization point inside the call.
    pub fn scan(
        &self,
        left: &Key,
        l_exclusive: bool,
        right: &Key,
        r_exclusive: bool,
        out: &mut Vec<(Key, &Record)>,
    ) -> Status {
        if left > right {
            return Status::Ok;
        }
        let mut spin = SpinWait::new();
        loop {
            let root = self.root.load(Ordering::Acquire);
            if root.is_null() {
                return Status::Ok;
            }
            let mut collected: Vec<(Key, *const Record)> = Vec::new();
            let mut current_key = left.clone();
            current_key.reset();
            let raced = unsafe {
                scan::scan_layer(
                    root,
                    true,
                    &mut current_key,
                    left,
                    l_exclusive,
                    right,
                    r_exclusive,
                    &mut collected,
                )
            };
            match raced {
                Ok(ScanControl::Continue) | Ok(ScanControl::Done) => {
                    out.extend(
                        collected
                            .into_iter()
                            .map(|(key, record)| (key, unsafe { &*record })),
                    );
                    return Status::Ok;
                },
                Err(_) => {
                    spin.spin();
                    continue;
                },
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.load(Ordering::Acquire).is_null()
    }
}

impl Drop for Masstree {
    fn drop(&mut self) {
        let root = *self.root.get_mut();
        if !root.is_null() {
            unsafe { free_subtree(root) };
        }
    }
}

/// Free a whole layer tree: nodes, live records, suffixes, and descending
/// layers. Only called from `Drop`, when no other thread can be touching
/// the index.
unsafe fn free_subtree(node: *mut Node) {
    if (*node).is_border() {
        let border = as_border(node);
        for i in 0..ORDER - 1 {
            let len = border.key_len(i);
            if len == KEY_LEN_LAYER {
                free_subtree(border.lv_next_layer(i));
            } else if (1..=KEY_LEN_HAS_SUFFIX).contains(&len) {
                let record = border.lv_record(i) as *mut Record;
                if !record.is_null() {
                    drop(Box::from_raw(record));
                }
            }
            let suffix = border.suffix(i);
            if !suffix.is_null() {
                drop(Box::from_raw(suffix));
            }
        }
        drop(Box::from_raw(node as *mut node::BorderNode));
    } else {
        let interior = as_interior(node);
        for i in 0..=interior.num_keys() {
            let child = interior.child(i);
            if !child.is_null() {
                free_subtree(child);
            }
        }
        drop(Box::from_raw(node as *mut node::InteriorNode));
    }
}
