use std::collections::VecDeque;

use common::Record;

use crate::{
    node::{
        BorderNode,
        InteriorNode,
    },
    suffix::BigSuffix,
};

enum Garbage {
    Border(*mut BorderNode),
    Interior(*mut InteriorNode),
    Record(*mut Record),
    Suffix(*mut BigSuffix),
}

/// Per-worker garbage list for nodes, records, and suffixes unlinked from
/// the index.
///
/// An unlinked object may still be reachable from a concurrent traversal,
/// so it is stamped with the epoch current at unlink time and freed only
/// once the global epoch has advanced past it by
/// [`GarbageCollector::RECLAIM_EPOCH_LAG`]. Workers refresh their local
/// epoch only between transactions, which bounds how far the global epoch
/// can move while any traversal pointer is live.
pub struct GarbageCollector {
    epoch: u64,
    items: VecDeque<(u64, Garbage)>,
}

// The raw pointers are exclusively owned once garbage-listed; the list
// itself lives on a single worker thread.
unsafe impl Send for GarbageCollector {}

impl GarbageCollector {
    pub const RECLAIM_EPOCH_LAG: u64 = 2;

    pub fn new() -> Self {
        Self {
            epoch: 1,
            items: VecDeque::new(),
        }
    }

    /// Record the epoch new garbage will be stamped with. Called by the
    /// worker whenever it refreshes its local epoch.
    pub fn set_epoch(&mut self, epoch: u64) {
        debug_assert!(epoch >= self.epoch);
        self.epoch = epoch;
    }

    pub fn add_border(&mut self, node: *mut BorderNode) {
        debug_assert!(unsafe { (*node).as_node().version().deleted() });
        self.items.push_back((self.epoch, Garbage::Border(node)));
    }

    pub fn add_interior(&mut self, node: *mut InteriorNode) {
        debug_assert!(unsafe { (*node).as_node().version().deleted() });
        self.items.push_back((self.epoch, Garbage::Interior(node)));
    }

    pub fn add_record(&mut self, record: *const Record) {
        self.items
            .push_back((self.epoch, Garbage::Record(record as *mut Record)));
    }

    pub fn add_suffix(&mut self, suffix: *mut BigSuffix) {
        self.items.push_back((self.epoch, Garbage::Suffix(suffix)));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Free everything stamped at least `RECLAIM_EPOCH_LAG` epochs behind
    /// `global_epoch`. Entries are epoch-ordered, so stop at the first one
    /// that is too young.
    pub fn reclaim(&mut self, global_epoch: u64) {
        while let Some((epoch, _)) = self.items.front() {
            if epoch + Self::RECLAIM_EPOCH_LAG > global_epoch {
                break;
            }
            let (_, garbage) = self.items.pop_front().expect("front checked above");
            unsafe { free(garbage) };
        }
    }

    /// Free everything regardless of age. Only valid once no other thread
    /// can touch the index (shutdown, or a test's single-threaded tail).
    pub fn reclaim_all(&mut self) {
        while let Some((_, garbage)) = self.items.pop_front() {
            unsafe { free(garbage) };
        }
    }
}

unsafe fn free(garbage: Garbage) {
    match garbage {
        Garbage::Border(ptr) => drop(Box::from_raw(ptr)),
        Garbage::Interior(ptr) => drop(Box::from_raw(ptr)),
        Garbage::Record(ptr) => drop(Box::from_raw(ptr)),
        Garbage::Suffix(ptr) => drop(Box::from_raw(ptr)),
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.reclaim_all();
    }
}
