use std::{
    array,
    ptr,
    sync::atomic::{
        AtomicPtr,
        AtomicU32,
        AtomicU64,
        AtomicU8,
        AtomicUsize,
        Ordering,
    },
};

use common::{
    backoff::SpinWait,
    Record,
};

use crate::{
    key::Key,
    permutation::Permutation,
    suffix::BigSuffix,
    version::Version,
};

pub const ORDER: usize = 16;

/// Slot key-length markers beyond the literal lengths 1..=8.
pub const KEY_LEN_HAS_SUFFIX: u8 = 9;
pub const KEY_LEN_UNSTABLE: u8 = 254;
pub const KEY_LEN_LAYER: u8 = 255;

/// Header shared by border and interior nodes. `InteriorNode` and
/// `BorderNode` embed it as their first field (`repr(C)`), so a `*mut Node`
/// can be cast to the concrete type indicated by the version's `is_border`
/// bit.
///
/// All fields are atomics: writers hold the version lock bit for compound
/// updates, readers follow the stable-version protocol. Node memory is freed
/// only through the epoch-deferred garbage collector, two global epochs
/// after the node was unlinked, which keeps every pointer a concurrent
/// traversal may still hold alive.
#[repr(C)]
pub struct Node {
    version: AtomicU32,
    parent: AtomicPtr<InteriorNode>,
    upper_layer: AtomicPtr<BorderNode>,
}

impl Node {
    fn new(version: Version) -> Self {
        Self {
            version: AtomicU32::new(version.raw()),
            parent: AtomicPtr::new(ptr::null_mut()),
            upper_layer: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn version(&self) -> Version {
        Version::from_raw(self.version.load(Ordering::Acquire))
    }

    pub fn set_version(&self, v: Version) {
        self.version.store(v.raw(), Ordering::Release);
    }

    /// Load the version repeatedly until neither `inserting` nor `splitting`
    /// is set.
    pub fn stable_version(&self) -> Version {
        let mut spin = SpinWait::new();
        loop {
            let v = self.version();
            if !v.inserting() && !v.splitting() {
                return v;
            }
            spin.spin();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.version().locked()
    }

    pub fn lock(&self) {
        let mut spin = SpinWait::new();
        loop {
            let expected = self.version();
            if expected.locked() {
                spin.spin();
                continue;
            }
            let desired = expected.with_locked(true);
            if self
                .version
                .compare_exchange_weak(
                    expected.raw(),
                    desired.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Release the lock: bump `v_insert` or `v_split` for whichever dirty
    /// bit was set, then clear lock and dirty bits.
    pub fn unlock(&self) {
        let v = self.version();
        debug_assert!(v.locked());
        debug_assert!(!(v.inserting() && v.splitting()));
        let mut v = if v.inserting() {
            v.bump_v_insert()
        } else if v.splitting() {
            v.bump_v_split()
        } else {
            v
        };
        v = v
            .with_locked(false)
            .with_inserting(false)
            .with_splitting(false);
        self.set_version(v);
    }

    // The single-bit setters below do a load + store on the version word.
    // That is race-free because the caller holds the lock bit: the only
    // concurrent writers are lock() CASes, which fail while locked is set.

    pub fn set_inserting(&self, inserting: bool) {
        let v = self.version();
        debug_assert!(v.locked());
        self.set_version(v.with_inserting(inserting));
    }

    pub fn set_splitting(&self, splitting: bool) {
        let v = self.version();
        debug_assert!(v.locked());
        self.set_version(v.with_splitting(splitting));
    }

    pub fn set_deleted(&self, deleted: bool) {
        let v = self.version();
        debug_assert!(v.locked());
        self.set_version(v.with_deleted(deleted));
    }

    pub fn set_is_root(&self, is_root: bool) {
        let v = self.version();
        self.set_version(v.with_is_root(is_root));
    }

    pub fn is_border(&self) -> bool {
        self.version().is_border()
    }

    pub fn parent(&self) -> *mut InteriorNode {
        self.parent.load(Ordering::Acquire)
    }

    /// The caller must hold the new parent's lock.
    pub fn set_parent(&self, p: *mut InteriorNode) {
        debug_assert!(p.is_null() || unsafe { (*p).node.is_locked() });
        self.parent.store(p, Ordering::Release);
    }

    pub fn upper_layer(&self) -> *mut BorderNode {
        self.upper_layer.load(Ordering::Acquire)
    }

    /// The caller must hold the new upper node's lock.
    pub fn set_upper_layer(&self, p: *mut BorderNode) {
        debug_assert!(p.is_null() || unsafe { (*p).node.is_locked() });
        self.upper_layer.store(p, Ordering::Release);
    }

    /// Lock the parent, re-checking that the parent pointer did not change
    /// while we were acquiring it.
    ///
    /// # Safety
    /// The parent pointer, if any, must still be reachable (guaranteed by
    /// epoch-deferred reclamation).
    pub unsafe fn locked_parent(&self) -> *mut InteriorNode {
        loop {
            let p = self.parent();
            if p.is_null() {
                return p;
            }
            (*p).node.lock();
            if ptr::eq(p, self.parent()) {
                return p;
            }
            (*p).node.unlock();
        }
    }

    /// Lock the upper-layer node, re-checking the pointer afterwards.
    ///
    /// # Safety
    /// Same reachability contract as [`Node::locked_parent`].
    pub unsafe fn locked_upper_layer(&self) -> *mut BorderNode {
        loop {
            let p = self.upper_layer();
            if p.is_null() {
                return p;
            }
            (*p).node.lock();
            if ptr::eq(p, self.upper_layer()) {
                return p;
            }
            (*p).node.unlock();
        }
    }
}

/// Cast helpers. Sound because both node types are `repr(C)` with the
/// header first and the `is_border` bit is set exactly once at allocation.
///
/// # Safety
/// `node` must point to a live node of the indicated kind.
pub unsafe fn as_border<'a>(node: *mut Node) -> &'a BorderNode {
    debug_assert!((*node).is_border());
    &*(node as *mut BorderNode)
}

/// # Safety
/// See [`as_border`].
pub unsafe fn as_interior<'a>(node: *mut Node) -> &'a InteriorNode {
    debug_assert!(!(*node).is_border());
    &*(node as *mut InteriorNode)
}

/// An interior node: up to 15 key-slice separators and 16 child pointers.
#[repr(C)]
pub struct InteriorNode {
    pub(crate) node: Node,
    n_keys: AtomicU8,
    key_slice: [AtomicU64; ORDER - 1],
    child: [AtomicPtr<Node>; ORDER],
}

impl InteriorNode {
    pub fn alloc() -> *mut InteriorNode {
        Box::into_raw(Box::new(InteriorNode {
            node: Node::new(Version::new_interior()),
            n_keys: AtomicU8::new(0),
            key_slice: array::from_fn(|_| AtomicU64::new(0)),
            child: array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }))
    }

    pub fn as_node(&self) -> &Node {
        &self.node
    }

    pub fn as_node_ptr(&self) -> *mut Node {
        self as *const InteriorNode as *mut Node
    }

    pub fn num_keys(&self) -> usize {
        self.n_keys.load(Ordering::Acquire) as usize
    }

    pub fn set_num_keys(&self, n: usize) {
        self.n_keys.store(n as u8, Ordering::Release);
    }

    pub fn increment_num_keys(&self) {
        self.n_keys.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_num_keys(&self) {
        self.n_keys.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_full(&self) -> bool {
        self.num_keys() == ORDER - 1
    }

    pub fn key_slice(&self, i: usize) -> u64 {
        self.key_slice[i].load(Ordering::Acquire)
    }

    pub fn set_key_slice(&self, i: usize, slice: u64) {
        self.key_slice[i].store(slice, Ordering::Release);
    }

    pub fn reset_key_slices(&self) {
        for slot in &self.key_slice {
            slot.store(0, Ordering::Release);
        }
    }

    pub fn child(&self, i: usize) -> *mut Node {
        self.child[i].load(Ordering::Acquire)
    }

    pub fn set_child(&self, i: usize, c: *mut Node) {
        self.child[i].store(c, Ordering::Release);
    }

    pub fn reset_children(&self) {
        for slot in &self.child {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// The leftmost child whose separator exceeds `slice`.
    pub fn find_child(&self, slice: u64) -> *mut Node {
        let num_keys = self.num_keys();
        for i in 0..num_keys {
            if slice < self.key_slice(i) {
                return self.child(i);
            }
        }
        self.child(num_keys)
    }

    /// The index of `target` among this node's children. The caller holds
    /// the lock, so the answer is stable.
    pub fn find_child_index(&self, target: *mut Node) -> usize {
        let mut index = 0;
        while index <= self.num_keys() && !ptr::eq(self.child(index), target) {
            index += 1;
        }
        debug_assert!(ptr::eq(self.child(index), target));
        index
    }
}

/// Outcome of searching a border node for one key slice.
#[derive(Clone, Copy, Debug)]
pub enum BorderSearch {
    NotFound,
    /// The slot holds the key's record; `lv` is the payload observed during
    /// the search.
    Value { index: usize, record: *const Record },
    /// The slot holds the root of a descending layer.
    Layer { index: usize, next_layer: *mut Node },
    /// A layer transition is in flight; retry the search.
    Unstable,
}

/// A border node: leaf of one trie layer. 15 key slots, each described by a
/// key-length byte, plus a packed permutation giving sorted order and
/// `prev`/`next` links for scans.
#[repr(C)]
pub struct BorderNode {
    pub(crate) node: Node,
    key_len: [AtomicU8; ORDER - 1],
    permutation: AtomicU64,
    key_slice: [AtomicU64; ORDER - 1],
    lv: [AtomicUsize; ORDER - 1],
    next: AtomicPtr<BorderNode>,
    prev: AtomicPtr<BorderNode>,
    key_suffixes: [AtomicPtr<BigSuffix>; ORDER - 1],
}

impl BorderNode {
    pub fn alloc() -> *mut BorderNode {
        Box::into_raw(Box::new(BorderNode {
            node: Node::new(Version::new_border()),
            key_len: array::from_fn(|_| AtomicU8::new(0)),
            permutation: AtomicU64::new(Permutation::size_one().raw()),
            key_slice: array::from_fn(|_| AtomicU64::new(0)),
            lv: array::from_fn(|_| AtomicUsize::new(0)),
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            key_suffixes: array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }))
    }

    pub fn as_node(&self) -> &Node {
        &self.node
    }

    pub fn as_node_ptr(&self) -> *mut Node {
        self as *const BorderNode as *mut Node
    }

    pub fn key_len(&self, i: usize) -> u8 {
        self.key_len[i].load(Ordering::Acquire)
    }

    pub fn set_key_len(&self, i: usize, len: u8) {
        self.key_len[i].store(len, Ordering::Release);
    }

    pub fn reset_key_lens(&self) {
        for slot in &self.key_len {
            slot.store(0, Ordering::Release);
        }
    }

    pub fn key_slice(&self, i: usize) -> u64 {
        self.key_slice[i].load(Ordering::Acquire)
    }

    pub fn set_key_slice(&self, i: usize, slice: u64) {
        self.key_slice[i].store(slice, Ordering::Release);
    }

    pub fn reset_key_slices(&self) {
        for slot in &self.key_slice {
            slot.store(0, Ordering::Release);
        }
    }

    pub fn permutation(&self) -> Permutation {
        Permutation::from_raw(self.permutation.load(Ordering::Acquire))
    }

    pub fn set_permutation(&self, p: Permutation) {
        self.permutation.store(p.raw(), Ordering::Release);
    }

    pub fn lv_raw(&self, i: usize) -> usize {
        self.lv[i].load(Ordering::Acquire)
    }

    pub fn set_lv_raw(&self, i: usize, raw: usize) {
        self.lv[i].store(raw, Ordering::Release);
    }

    pub fn lv_record(&self, i: usize) -> *const Record {
        self.lv_raw(i) as *const Record
    }

    pub fn set_lv_record(&self, i: usize, record: *const Record) {
        self.set_lv_raw(i, record as usize);
    }

    pub fn lv_next_layer(&self, i: usize) -> *mut Node {
        self.lv_raw(i) as *mut Node
    }

    pub fn set_lv_next_layer(&self, i: usize, next_layer: *mut Node) {
        self.set_lv_raw(i, next_layer as usize);
    }

    pub fn reset_lvs(&self) {
        for slot in &self.lv {
            slot.store(0, Ordering::Release);
        }
    }

    pub fn suffix(&self, i: usize) -> *mut BigSuffix {
        self.key_suffixes[i].load(Ordering::Acquire)
    }

    pub fn set_suffix(&self, i: usize, suffix: *mut BigSuffix) {
        self.key_suffixes[i].store(suffix, Ordering::Release);
    }

    pub fn reset_suffixes(&self) {
        for slot in &self.key_suffixes {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }

    pub fn next(&self) -> *mut BorderNode {
        self.next.load(Ordering::Acquire)
    }

    pub fn set_next(&self, next: *mut BorderNode) {
        self.next.store(next, Ordering::Release);
    }

    pub fn prev(&self) -> *mut BorderNode {
        self.prev.load(Ordering::Acquire)
    }

    pub fn set_prev(&self, prev: *mut BorderNode) {
        self.prev.store(prev, Ordering::Release);
    }

    /// The smallest key slice currently in the node.
    pub fn lowest_key(&self) -> u64 {
        let permutation = self.permutation();
        self.key_slice(permutation.key_index(0))
    }

    /// Search the node for the key's current slice.
    ///
    /// 1. If the key has no further slice, only a literal-length slot
    ///    (1..=8) can match.
    /// 2. Otherwise the key extends past this slice: a `has_suffix` slot
    ///    matches if the stored suffix spells the key's tail, a `layer` slot
    ///    directs the search downward, and `unstable` forces a retry.
    ///
    /// # Safety
    /// Suffix pointers read here must be reachable (epoch-deferred
    /// reclamation).
    pub unsafe fn search_link_or_value(&self, key: &Key) -> BorderSearch {
        let current = key.current_slice();
        let permutation = self.permutation();

        if !key.has_next() {
            for i in 0..permutation.num_keys() {
                let true_index = permutation.key_index(i);
                if self.key_slice(true_index) == current.slice
                    && self.key_len(true_index) == current.size
                {
                    return BorderSearch::Value {
                        index: true_index,
                        record: self.lv_record(true_index),
                    };
                }
            }
        } else {
            for i in 0..permutation.num_keys() {
                let true_index = permutation.key_index(i);
                if self.key_slice(true_index) != current.slice {
                    continue;
                }
                match self.key_len(true_index) {
                    KEY_LEN_HAS_SUFFIX => {
                        let suffix = self.suffix(true_index);
                        if !suffix.is_null() && (*suffix).matches(key, key.cursor + 1) {
                            return BorderSearch::Value {
                                index: true_index,
                                record: self.lv_record(true_index),
                            };
                        }
                    },
                    KEY_LEN_LAYER => {
                        return BorderSearch::Layer {
                            index: true_index,
                            next_layer: self.lv_next_layer(true_index),
                        };
                    },
                    KEY_LEN_UNSTABLE => return BorderSearch::Unstable,
                    _ => {},
                }
            }
        }
        BorderSearch::NotFound
    }

    /// The first free slot: a never-used one, or a removed one that can be
    /// reused (the latter requires `inserting` so readers retry).
    pub fn insert_point(&self) -> (usize, bool) {
        debug_assert!(self.permutation().is_not_full());
        for i in 0..ORDER - 1 {
            let len = self.key_len(i);
            if len == 0 {
                return (i, false);
            }
            if (10..=18).contains(&len) {
                return (i, true);
            }
        }
        unreachable!("permutation not full but no free slot");
    }

    /// Mark slot `i` removed by offsetting its length by 9, making it
    /// reusable without confusing concurrent readers.
    pub fn mark_key_removed(&self, i: usize) {
        let len = self.key_len(i);
        debug_assert!((1..=KEY_LEN_HAS_SUFFIX).contains(&len));
        self.set_key_len(i, len + 9);
    }

    pub fn is_key_removed(&self, i: usize) -> bool {
        (10..=18).contains(&self.key_len(i))
    }

    /// The slot whose payload is `next_layer`. The caller holds the lock.
    pub fn find_next_layer_index(&self, next_layer: *mut Node) -> usize {
        debug_assert!(self.node.is_locked());
        for i in 0..ORDER - 1 {
            if self.lv_next_layer(i) == next_layer {
                return i;
            }
        }
        unreachable!("child layer not referenced by upper border node");
    }

    /// Unlink this node from the border list before deletion.
    ///
    /// # Safety
    /// Caller holds this node's lock; neighbors must be reachable.
    pub unsafe fn connect_prev_and_next(&self) {
        loop {
            let prev = self.prev();
            if !prev.is_null() {
                (*prev).node.lock();
                if (*prev).node.version().deleted() || !ptr::eq(prev, self.prev()) {
                    (*prev).node.unlock();
                    continue;
                }
                let next = self.next();
                (*prev).set_next(next);
                if !next.is_null() {
                    debug_assert!(!(*next).node.version().deleted());
                    (*next).set_prev(prev);
                }
                (*prev).node.unlock();
            } else {
                let next = self.next();
                if !next.is_null() {
                    (*next).set_prev(ptr::null_mut());
                }
            }
            return;
        }
    }

    /// Physically sort the slots into permutation order. Only called with
    /// the lock held and `splitting` set, right before a split.
    ///
    /// # Safety
    /// Caller holds the lock with `splitting` set; concurrent readers will
    /// retry off the version change.
    pub unsafe fn sort(&self) {
        let permutation = self.permutation();
        debug_assert!(permutation.is_full());
        debug_assert!(self.node.is_locked());
        debug_assert!(self.node.version().splitting());

        let mut tmp_key_len = [0u8; ORDER - 1];
        let mut tmp_key_slice = [0u64; ORDER - 1];
        let mut tmp_lv = [0usize; ORDER - 1];
        let mut tmp_suffix = [ptr::null_mut::<BigSuffix>(); ORDER - 1];

        for i in 0..ORDER - 1 {
            let true_index = permutation.key_index(i);
            tmp_key_len[i] = self.key_len(true_index);
            tmp_key_slice[i] = self.key_slice(true_index);
            tmp_lv[i] = self.lv_raw(true_index);
            tmp_suffix[i] = self.suffix(true_index);
        }
        for i in 0..ORDER - 1 {
            self.set_key_len(i, tmp_key_len[i]);
            self.set_key_slice(i, tmp_key_slice[i]);
            self.set_lv_raw(i, tmp_lv[i]);
            self.set_suffix(i, tmp_suffix[i]);
        }
        self.set_permutation(Permutation::from_sorted(ORDER - 1));
    }
}

/// Descend from a layer root to the border node covering the key's current
/// slice, validating against concurrent splits on the way down.
///
/// # Safety
/// `root` must be a live node of the layer; epoch-deferred reclamation keeps
/// every pointer this walk can observe alive.
pub unsafe fn find_border(mut root: *mut Node, key: &Key) -> (*mut BorderNode, Version) {
    'retry: loop {
        let mut node = root;
        let mut version = (*node).stable_version();
        if !version.is_root() {
            // Someone is moving the root; climb and take it from the top.
            let parent = (*node).parent();
            if !parent.is_null() {
                root = (*parent).as_node_ptr();
            }
            continue 'retry;
        }
        loop {
            if (*node).is_border() {
                return (node as *mut BorderNode, version);
            }
            let interior = as_interior(node);
            let next = interior.find_child(key.current_slice().slice);
            if next.is_null() {
                continue 'retry;
            }
            let next_version = (*next).stable_version();
            if (*next).version().xor(next_version) <= Version::HAS_LOCKED {
                node = next;
                version = next_version;
                continue;
            }
            // The child moved under us; re-validate this node and restart
            // from the root if it split.
            let validation_version = (*node).stable_version();
            if validation_version.v_split() != version.v_split() {
                continue 'retry;
            }
            version = validation_version;
        }
    }
}

/// Descend to the leftmost border node of a layer, used to begin a
/// sub-layer scan.
///
/// # Safety
/// Same contract as [`find_border`].
pub unsafe fn find_leftmost_border(mut root: *mut Node) -> (*mut BorderNode, Version) {
    'retry: loop {
        let mut node = root;
        let mut version = (*node).stable_version();
        if !version.is_root() {
            let parent = (*node).parent();
            if !parent.is_null() {
                root = (*parent).as_node_ptr();
            }
            continue 'retry;
        }
        loop {
            if (*node).is_border() {
                return (node as *mut BorderNode, version);
            }
            let interior = as_interior(node);
            let next = interior.child(0);
            if next.is_null() {
                continue 'retry;
            }
            let next_version = (*next).stable_version();
            if (*next).version().xor(next_version) <= Version::HAS_LOCKED {
                node = next;
                version = next_version;
                continue;
            }
            let validation_version = (*node).stable_version();
            if validation_version.v_split() != version.v_split() {
                continue 'retry;
            }
            version = validation_version;
        }
    }
}
