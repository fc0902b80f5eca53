use std::ptr;

use common::Record;

use crate::{
    gc::GarbageCollector,
    key::Key,
    node::{
        as_border,
        find_border,
        BorderNode,
        BorderSearch,
        InteriorNode,
        Node,
        KEY_LEN_HAS_SUFFIX,
        KEY_LEN_LAYER,
        KEY_LEN_UNSTABLE,
        ORDER,
    },
    suffix::BigSuffix,
    version::Version,
};

pub(crate) enum PutResult {
    /// Inserted; the layer's root is the returned node (unchanged unless a
    /// split or first insert replaced it).
    Done(*mut Node),
    AlreadyExists,
    /// The border we landed on was a deleted layer root; the caller must
    /// restart one layer up.
    RetryFromUpperLayer,
}

/// Build the first border node of a fresh tree (or fresh layer) holding
/// just `key`.
pub(crate) unsafe fn start_new_tree(key: &Key, record: *const Record) -> *mut BorderNode {
    let root = BorderNode::alloc();
    (*root).as_node().set_is_root(true);

    let cursor = key.current_slice();
    if (1..=7).contains(&cursor.size) {
        (*root).set_key_len(0, cursor.size);
        (*root).set_key_slice(0, cursor.slice);
        (*root).set_lv_record(0, record);
    } else {
        debug_assert_eq!(cursor.size, 8);
        (*root).set_key_slice(0, cursor.slice);
        (*root).set_lv_record(0, record);
        if key.has_next() {
            (*root).set_key_len(0, KEY_LEN_HAS_SUFFIX);
            let suffix = Box::into_raw(Box::new(BigSuffix::from_key(key, key.cursor + 1)));
            (*root).set_suffix(0, suffix);
        } else {
            (*root).set_key_len(0, 8);
        }
    }
    root
}

/// Free a never-published tree-of-one built by [`start_new_tree`] after
/// losing the root-installation race. The caller keeps ownership of the
/// record.
pub(crate) unsafe fn free_unpublished_root(root: *mut BorderNode) {
    let suffix = (*root).suffix(0);
    if !suffix.is_null() {
        drop(Box::from_raw(suffix));
    }
    drop(Box::from_raw(root));
}

/// Does inserting `key` here collide with an existing `has_suffix`/`layer`
/// slot on the same slice? Returns the conflicting slot.
unsafe fn check_break_invariant(border: &BorderNode, key: &Key) -> Option<usize> {
    debug_assert!(border.as_node().is_locked());
    if !key.has_next() {
        return None;
    }
    let cursor = key.current_slice();
    let permutation = border.permutation();
    for i in 0..permutation.num_keys() {
        let true_index = permutation.key_index(i);
        let len = border.key_len(true_index);
        if (len == KEY_LEN_HAS_SUFFIX || len == KEY_LEN_LAYER)
            && border.key_slice(true_index) == cursor.slice
        {
            return Some(true_index);
        }
    }
    None
}

/// Push the conflicting key's suffix down into a fresh layer so both keys
/// can coexist under the shared slice.
///
/// The slot transitions `has_suffix -> unstable -> (install pointer) ->
/// layer`; readers observing `unstable` retry, readers observing `layer`
/// see the fully installed child.
unsafe fn handle_break_invariant(
    border: &BorderNode,
    old_index: usize,
    gc: &mut GarbageCollector,
) {
    debug_assert!(border.as_node().is_locked());
    if border.key_len(old_index) != KEY_LEN_HAS_SUFFIX {
        debug_assert_eq!(border.key_len(old_index), KEY_LEN_LAYER);
        return;
    }

    let n1 = BorderNode::alloc();
    (*n1).as_node().set_is_root(true);
    (*n1)
        .as_node()
        .set_upper_layer(border as *const BorderNode as *mut BorderNode);

    let k2_record = border.lv_record(old_index);
    let old_suffix = border.suffix(old_index);
    debug_assert!(!old_suffix.is_null());
    let suffix = &*old_suffix;
    let first = suffix.first_slice();
    (*n1).set_key_slice(0, first.slice);
    (*n1).set_lv_record(0, k2_record);
    if suffix.has_next() {
        (*n1).set_key_len(0, KEY_LEN_HAS_SUFFIX);
        (*n1).set_suffix(0, Box::into_raw(Box::new(suffix.without_first())));
    } else {
        (*n1).set_key_len(0, first.size);
    }

    border.set_key_len(old_index, KEY_LEN_UNSTABLE);
    border.set_lv_next_layer(old_index, (*n1).as_node_ptr());
    border.set_key_len(old_index, KEY_LEN_LAYER);
    gc.add_suffix(old_suffix);
    border.set_suffix(old_index, ptr::null_mut());
}

/// Install `key -> record` into a border node that has room.
unsafe fn insert_to_border(
    border: &BorderNode,
    key: &Key,
    record: *const Record,
    gc: &mut GarbageCollector,
) {
    debug_assert!(border.as_node().is_locked());
    debug_assert!(!border.as_node().version().splitting());
    debug_assert!(!border.as_node().version().inserting());
    let mut permutation = border.permutation();
    debug_assert!(permutation.is_not_full());

    let cursor = key.current_slice();
    let num_keys = permutation.num_keys();
    let mut insertion_point = 0;
    while insertion_point < num_keys
        && border.key_slice(permutation.key_index(insertion_point)) < cursor.slice
    {
        insertion_point += 1;
    }

    let (true_index, reuse) = border.insert_point();
    if reuse {
        // A removed slot keeps its byte fields until reused; flag the write
        // so concurrent readers retry instead of seeing a half-replaced key.
        border.as_node().set_inserting(true);
        let stale_suffix = border.suffix(true_index);
        if !stale_suffix.is_null() {
            gc.add_suffix(stale_suffix);
        }
    }
    border.set_suffix(true_index, ptr::null_mut());

    border.set_key_slice(true_index, cursor.slice);
    border.set_lv_record(true_index, record);
    if (1..=7).contains(&cursor.size) {
        border.set_key_len(true_index, cursor.size);
    } else {
        debug_assert_eq!(cursor.size, 8);
        if key.has_next() {
            let suffix = Box::into_raw(Box::new(BigSuffix::from_key(key, key.cursor + 1)));
            border.set_suffix(true_index, suffix);
            border.set_key_len(true_index, KEY_LEN_HAS_SUFFIX);
        } else {
            border.set_key_len(true_index, 8);
        }
    }
    permutation.insert(insertion_point, true_index);
    border.set_permutation(permutation);
}

/// The distinct slices of a full border node in slot order (the node has
/// been sorted), with the index of each slice's first occurrence.
unsafe fn create_slice_table(border: &BorderNode) -> Vec<(u64, usize)> {
    debug_assert!(border.permutation().is_full());
    let mut table: Vec<(u64, usize)> = Vec::new();
    for i in 0..ORDER - 1 {
        let slice = border.key_slice(i);
        if !table.iter().any(|(s, _)| *s == slice) {
            table.push((slice, i));
        }
    }
    table
}

/// Pick the split index over the 16-entry temporary array such that every
/// occurrence of a slice lands on one side. This keeps conflicting suffixes
/// for a slice within a single layer.
fn split_point(new_slice: u64, table: &[(u64, usize)]) -> usize {
    let min_slice = table[0].0;
    let max_slice = table[table.len() - 1].0;
    if new_slice < min_slice {
        return 1;
    }
    if new_slice == min_slice {
        debug_assert!(table.len() > 1);
        return table[1].1 + 1;
    }
    if new_slice < max_slice {
        if let Some(entry) = table.iter().find(|(s, _)| *s == new_slice) {
            return entry.1;
        }
        let entry = table
            .iter()
            .find(|(s, _)| *s > new_slice)
            .expect("a larger slice exists below the maximum");
        return entry.1 + 1;
    }
    if new_slice == max_slice {
        let entry = table
            .iter()
            .find(|(s, _)| *s == new_slice)
            .expect("maximum slice is in the table");
        return entry.1;
    }
    ORDER - 1
}

/// Split a full border node, distributing its 15 keys plus the new key
/// between `node` and the fresh right sibling `node1`.
unsafe fn split_keys_among_border(
    node: &BorderNode,
    node1: &BorderNode,
    key: &Key,
    record: *const Record,
) {
    debug_assert!(node.permutation().is_full());
    debug_assert!(node.as_node().is_locked());
    debug_assert!(node.as_node().version().splitting());
    debug_assert!(node1.as_node().is_locked());
    debug_assert!(node1.as_node().version().splitting());

    // Sorting first makes slot order equal key order for the copy below.
    node.sort();

    let mut tmp_key_len = [0u8; ORDER];
    let mut tmp_key_slice = [0u64; ORDER];
    let mut tmp_lv = [0usize; ORDER];
    let mut tmp_suffix = [ptr::null_mut::<BigSuffix>(); ORDER];

    let cursor = key.current_slice();
    let mut insertion_index = 0;
    while insertion_index < ORDER - 1 && node.key_slice(insertion_index) < cursor.slice {
        insertion_index += 1;
    }

    let mut j = 0;
    for i in 0..ORDER - 1 {
        if j == insertion_index {
            j += 1;
        }
        tmp_key_len[j] = node.key_len(i);
        tmp_key_slice[j] = node.key_slice(i);
        tmp_lv[j] = node.lv_raw(i);
        tmp_suffix[j] = node.suffix(i);
        j += 1;
    }
    tmp_key_slice[insertion_index] = cursor.slice;
    tmp_lv[insertion_index] = record as usize;
    if (1..=7).contains(&cursor.size) {
        tmp_key_len[insertion_index] = cursor.size;
    } else {
        debug_assert_eq!(cursor.size, 8);
        if key.has_next() {
            tmp_key_len[insertion_index] = KEY_LEN_HAS_SUFFIX;
            tmp_suffix[insertion_index] =
                Box::into_raw(Box::new(BigSuffix::from_key(key, key.cursor + 1)));
        } else {
            tmp_key_len[insertion_index] = 8;
        }
    }

    let table = create_slice_table(node);
    let split = split_point(cursor.slice, &table);

    node.reset_key_lens();
    node.reset_key_slices();
    node.reset_lvs();
    node.reset_suffixes();
    node1.reset_key_lens();
    node1.reset_key_slices();
    node1.reset_lvs();
    node1.reset_suffixes();

    for i in 0..split {
        node.set_key_len(i, tmp_key_len[i]);
        node.set_key_slice(i, tmp_key_slice[i]);
        node.set_lv_raw(i, tmp_lv[i]);
        node.set_suffix(i, tmp_suffix[i]);
        if tmp_key_len[i] == KEY_LEN_LAYER {
            (*node.lv_next_layer(i))
                .set_upper_layer(node as *const BorderNode as *mut BorderNode);
        }
    }
    node.set_permutation(crate::permutation::Permutation::from_sorted(split));

    for (j, i) in (split..ORDER).enumerate() {
        node1.set_key_len(j, tmp_key_len[i]);
        node1.set_key_slice(j, tmp_key_slice[i]);
        node1.set_lv_raw(j, tmp_lv[i]);
        node1.set_suffix(j, tmp_suffix[i]);
        if tmp_key_len[i] == KEY_LEN_LAYER {
            (*node1.lv_next_layer(j))
                .set_upper_layer(node1 as *const BorderNode as *mut BorderNode);
        }
    }
    node1.set_permutation(crate::permutation::Permutation::from_sorted(ORDER - split));

    let old_next = node.next();
    node1.set_next(old_next);
    node1.set_prev(node as *const BorderNode as *mut BorderNode);
    node.set_next(node1 as *const BorderNode as *mut BorderNode);
    if !old_next.is_null() {
        (*old_next).set_prev(node1 as *const BorderNode as *mut BorderNode);
    }
}

/// Split a full interior node around the insertion of `(slice, node1)` at
/// `node_index`. Returns the separator pulled up to the next level.
unsafe fn split_keys_among_interior(
    parent: &InteriorNode,
    parent1: &InteriorNode,
    slice: u64,
    node1: *mut Node,
    node_index: usize,
) -> u64 {
    debug_assert!(parent.is_full());
    debug_assert!(parent.as_node().is_locked());
    debug_assert!(parent.as_node().version().splitting());
    debug_assert!(parent1.as_node().is_locked());
    debug_assert!(parent1.as_node().version().splitting());

    let mut tmp_key_slice = [0u64; ORDER];
    let mut tmp_child = [ptr::null_mut::<Node>(); ORDER + 1];

    let num_keys = parent.num_keys();
    let mut j = 0;
    for i in 0..num_keys + 1 {
        if j == node_index + 1 {
            j += 1;
        }
        tmp_child[j] = parent.child(i);
        j += 1;
    }
    let mut j = 0;
    for i in 0..num_keys {
        if j == node_index {
            j += 1;
        }
        tmp_key_slice[j] = parent.key_slice(i);
        j += 1;
    }
    tmp_child[node_index + 1] = node1;
    tmp_key_slice[node_index] = slice;

    parent.set_num_keys(0);
    parent.reset_key_slices();
    parent.reset_children();

    let split = ORDER / 2;
    let parent_ptr = parent as *const InteriorNode as *mut InteriorNode;
    let parent1_ptr = parent1 as *const InteriorNode as *mut InteriorNode;
    for i in 0..split - 1 {
        parent.set_child(i, tmp_child[i]);
        (*tmp_child[i]).set_parent(parent_ptr);
        parent.set_key_slice(i, tmp_key_slice[i]);
        parent.increment_num_keys();
    }
    parent.set_child(split - 1, tmp_child[split - 1]);
    (*tmp_child[split - 1]).set_parent(parent_ptr);
    let k_prime = tmp_key_slice[split - 1];

    let mut j = 0;
    for i in split..ORDER {
        parent1.set_child(j, tmp_child[i]);
        (*tmp_child[i]).set_parent(parent1_ptr);
        parent1.set_key_slice(j, tmp_key_slice[i]);
        parent1.increment_num_keys();
        j += 1;
    }
    parent1.set_child(j, tmp_child[ORDER]);
    (*tmp_child[ORDER]).set_parent(parent1_ptr);

    k_prime
}

/// Hook a freshly split pair under a brand-new interior root.
unsafe fn create_root_with_children(
    left: *mut Node,
    slice: u64,
    right: *mut Node,
) -> *mut InteriorNode {
    debug_assert!((*left).version().is_root());
    debug_assert!((*left).parent().is_null());
    debug_assert!((*right).parent().is_null());
    debug_assert!((*left).version().locked());
    debug_assert!((*right).version().locked());

    let root = InteriorNode::alloc();
    (*root).as_node().lock();
    let upper = (*left).locked_upper_layer();
    (*root).as_node().set_is_root(true);
    (*root).as_node().set_upper_layer(upper);
    if !upper.is_null() {
        let left_index = (*upper).find_next_layer_index(left);
        (*upper).set_lv_next_layer(left_index, (*root).as_node_ptr());
    }
    (*root).set_num_keys(1);
    (*root).set_key_slice(0, slice);
    (*root).set_child(0, left);
    (*root).set_child(1, right);
    (*left).set_parent(root);
    (*right).set_parent(root);
    (*left).set_upper_layer(ptr::null_mut());
    (*left).set_is_root(false);
    (*right).set_is_root(false);
    if !upper.is_null() {
        (*upper).as_node().unlock();
    }
    (*root).as_node().unlock();
    root
}

/// Insert `(slice, node1)` into a parent with room, after `node_index`.
unsafe fn insert_into_parent(
    parent: &InteriorNode,
    node1: *mut Node,
    slice: u64,
    node_index: usize,
) {
    debug_assert!(!parent.is_full());
    debug_assert!(parent.as_node().is_locked());
    debug_assert!(parent.as_node().version().inserting());
    debug_assert!((*node1).version().locked());

    let mut i = parent.num_keys();
    while i > node_index {
        parent.set_child(i + 1, parent.child(i));
        parent.set_key_slice(i, parent.key_slice(i - 1));
        i -= 1;
    }
    parent.set_child(node_index + 1, node1);
    parent.set_key_slice(node_index, slice);
    parent.increment_num_keys();
    (*node1).set_parent(parent as *const InteriorNode as *mut InteriorNode);
}

/// Split a full border node and walk the split up the tree. Returns the new
/// layer root if one was created.
unsafe fn split(node: *mut Node, key: &Key, record: *const Record) -> Option<*mut Node> {
    debug_assert!((*node).version().locked());
    (*node).set_splitting(true);
    let border1 = BorderNode::alloc();
    let node1 = (*border1).as_node_ptr();
    (*node1).set_version((*node).version());
    split_keys_among_border(as_border(node), as_border(node1), key, record);

    let mut node = node;
    let mut node1 = node1;
    let mut pull_up: Option<u64> = None;
    loop {
        debug_assert!((*node).version().locked());
        debug_assert!((*node1).version().locked());
        let parent = (*node).locked_parent();
        let up = match pull_up {
            Some(up) => up,
            // Only reachable while node1 is still the border sibling.
            None => as_border(node1).key_slice(0),
        };
        if parent.is_null() {
            let new_root = create_root_with_children(node, up, node1);
            (*node).unlock();
            (*node1).unlock();
            return Some((*new_root).as_node_ptr());
        } else if !(*parent).is_full() {
            (*parent).as_node().set_inserting(true);
            let node_index = (*parent).find_child_index(node);
            insert_into_parent(&*parent, node1, up, node_index);
            (*node).unlock();
            (*node1).unlock();
            (*parent).as_node().unlock();
            return None;
        } else {
            (*parent).as_node().set_splitting(true);
            let node_index = (*parent).find_child_index(node);
            (*node).unlock();
            let parent1 = InteriorNode::alloc();
            (*parent1).as_node().set_version((*parent).as_node().version());
            let k_prime =
                split_keys_among_interior(&*parent, &*parent1, up, node1, node_index);
            pull_up = Some(k_prime);
            (*node1).unlock();
            node = (*parent).as_node_ptr();
            node1 = (*parent1).as_node_ptr();
        }
    }
}

/// Insert within one layer, recursing into deeper layers as needed.
///
/// # Safety
/// `root` is a live layer root; the record pointer stays owned by the
/// caller until `Done` is returned.
pub(crate) unsafe fn insert(
    root: *mut Node,
    key: &mut Key,
    record: *const Record,
    gc: &mut GarbageCollector,
) -> PutResult {
    'retry: loop {
        let (border, _) = find_border(root, key);
        (*border).as_node().lock();
        // Reload after locking; the border may have changed between
        // find_border and lock().
        let mut version = (*border).as_node().version();
        let mut border = border;
        'forward: loop {
            debug_assert!((*border).as_node().is_locked());
            if version.deleted() {
                (*border).as_node().unlock();
                if version.is_root() {
                    return PutResult::RetryFromUpperLayer;
                }
                continue 'retry;
            }
            let result = (*border).search_link_or_value(key);
            if Version::split_happened(version, (*border).as_node().version()) {
                // A split slipped in before our lock; chase the right
                // sibling chain to the border now covering the slice.
                let mut next = (*border).next();
                (*border).as_node().unlock();
                debug_assert!(!next.is_null());
                while !version.deleted()
                    && !next.is_null()
                    && key.current_slice().slice >= (*next).lowest_key()
                {
                    border = next;
                    version = (*border).as_node().stable_version();
                    next = (*border).next();
                }
                (*border).as_node().lock();
                version = (*border).as_node().version();
                continue 'forward;
            }
            match result {
                BorderSearch::NotFound => {
                    if let Some(old_index) = check_break_invariant(&*border, key) {
                        handle_break_invariant(&*border, old_index, gc);
                        let next_layer = (*border).lv_next_layer(old_index);
                        (*border).as_node().unlock();
                        key.next();
                        match insert(next_layer, key, record, gc) {
                            PutResult::RetryFromUpperLayer => {
                                key.back();
                                continue 'retry;
                            },
                            PutResult::AlreadyExists => return PutResult::AlreadyExists,
                            PutResult::Done(_) => return PutResult::Done(root),
                        }
                    }
                    let permutation = (*border).permutation();
                    if permutation.is_not_full() {
                        insert_to_border(&*border, key, record, gc);
                        (*border).as_node().unlock();
                        return PutResult::Done(root);
                    }
                    match split((*border).as_node_ptr(), key, record) {
                        Some(new_root) => return PutResult::Done(new_root),
                        None => return PutResult::Done(root),
                    }
                },
                BorderSearch::Value { .. } => {
                    // Unique-constraint violation: the record (absent or
                    // installed) already exists.
                    (*border).as_node().unlock();
                    return PutResult::AlreadyExists;
                },
                BorderSearch::Layer { next_layer, .. } => {
                    (*border).as_node().unlock();
                    key.next();
                    match insert(next_layer, key, record, gc) {
                        PutResult::RetryFromUpperLayer => {
                            key.back();
                            continue 'retry;
                        },
                        PutResult::AlreadyExists => return PutResult::AlreadyExists,
                        PutResult::Done(_) => return PutResult::Done(root),
                    }
                },
                BorderSearch::Unstable => {
                    unreachable!("unstable slot observed while holding the border lock")
                },
            }
        }
    }
}
