use std::ptr;

use crate::{
    gc::GarbageCollector,
    key::Key,
    node::{
        find_border,
        BorderNode,
        BorderSearch,
        Node,
        KEY_LEN_HAS_SUFFIX,
        KEY_LEN_UNSTABLE,
        ORDER,
    },
    suffix::BigSuffix,
    version::Version,
};

pub(crate) enum RemoveResult {
    NotFound,
    /// Removed without changing this layer's root.
    Done,
    /// Removed and this layer's root was replaced; null means the layer
    /// (and at layer 0, the whole tree) is gone.
    NewRoot(*mut Node),
    /// Removed by collapsing this single-key layer into the layer above;
    /// the caller retries the removal one layer up.
    LayerDeleted,
}

/// Collapse a layer-root border holding exactly one key: relocate that key
/// (as a suffix) into the slot of the upper layer that pointed here, then
/// delete the border.
unsafe fn handle_delete_layer(border: *mut BorderNode, gc: &mut GarbageCollector) {
    let permutation = (*border).permutation();
    debug_assert!((*border).as_node().parent().is_null());
    debug_assert_eq!(permutation.num_keys(), 1);
    debug_assert!((*border).as_node().version().is_root());
    debug_assert!(!(*border).as_node().upper_layer().is_null());
    debug_assert!((*border).as_node().is_locked());

    let slot = permutation.key_index(0);
    let len = (*border).key_len(slot);
    let upper_suffix = if len == KEY_LEN_HAS_SUFFIX {
        let old_suffix = (*border).suffix(slot);
        debug_assert!(!old_suffix.is_null());
        let relocated = (*old_suffix).with_front((*border).key_slice(slot));
        gc.add_suffix(old_suffix);
        relocated
    } else {
        debug_assert!((1..=8).contains(&len));
        BigSuffix::single((*border).key_slice(slot), len)
    };

    // Rewrite the upper slot hand-over-hand: unstable -> suffix -> payload
    // -> has_suffix. Readers seeing unstable retry.
    let upper = (*border).as_node().locked_upper_layer();
    let next_layer_index = (*upper).find_next_layer_index((*border).as_node_ptr());
    (*upper).set_key_len(next_layer_index, KEY_LEN_UNSTABLE);
    debug_assert!((*upper).suffix(next_layer_index).is_null());
    (*upper).set_suffix(next_layer_index, Box::into_raw(Box::new(upper_suffix)));
    (*upper).set_lv_raw(next_layer_index, (*border).lv_raw(slot));
    (*upper).set_key_len(next_layer_index, KEY_LEN_HAS_SUFFIX);

    (*border).set_lv_raw(slot, 0);
    (*border).set_suffix(slot, ptr::null_mut());
    (*border).as_node().set_deleted(true);
    gc.add_border(border);
    (*border).as_node().unlock();
    (*upper).as_node().unlock();
}

/// Remove a drained border node from its parent, restructuring the tree
/// when the parent itself drains.
unsafe fn delete_border_node(border: *mut BorderNode, gc: &mut GarbageCollector) -> RemoveResult {
    debug_assert!((*border).as_node().is_locked());
    debug_assert_eq!((*border).permutation().num_keys(), 0);

    if (*border).as_node().version().is_root() {
        // The layer is now empty; only layer 0 can get here, deeper layers
        // collapse while they still hold one key.
        debug_assert!((*border).as_node().parent().is_null());
        debug_assert!((*border).as_node().upper_layer().is_null());
        (*border).as_node().set_deleted(true);
        gc.add_border(border);
        (*border).as_node().unlock();
        return RemoveResult::NewRoot(ptr::null_mut());
    }

    let parent = (*border).as_node().locked_parent();
    debug_assert!(!parent.is_null());
    let next_layer_index = (*parent).find_child_index((*border).as_node_ptr());

    if (*parent).num_keys() >= 2 {
        // Shift the parent's entries left over the removed child.
        (*parent).as_node().set_inserting(true);
        let start_key_index = next_layer_index.saturating_sub(1);
        let start_child_index = if next_layer_index == 0 {
            0
        } else {
            next_layer_index
        };
        for i in start_key_index..ORDER - 2 {
            (*parent).set_key_slice(i, (*parent).key_slice(i + 1));
        }
        for i in start_child_index..ORDER - 1 {
            (*parent).set_child(i, (*parent).child(i + 1));
        }
        (*parent).decrement_num_keys();
        (*border).connect_prev_and_next();
        (*border).as_node().set_deleted(true);
        gc.add_border(border);
        (*border).as_node().unlock();
        (*parent).as_node().unlock();
        return RemoveResult::Done;
    }

    debug_assert_eq!((*parent).num_keys(), 1);
    let pull_up_index = usize::from(next_layer_index != 1);
    let pull_up = (*parent).child(pull_up_index);

    if (*parent).as_node().version().is_root() {
        debug_assert!((*parent).as_node().parent().is_null());
        let upper = (*parent).as_node().locked_upper_layer();
        if upper.is_null() {
            // Layer 0: the sibling becomes the tree root.
            (*pull_up).set_is_root(true);
            (*pull_up).set_parent(ptr::null_mut());
            (*pull_up).set_upper_layer(ptr::null_mut());
            (*border).connect_prev_and_next();
            (*border).as_node().set_deleted(true);
            gc.add_border(border);
            (*border).as_node().unlock();
            (*parent).as_node().set_deleted(true);
            gc.add_interior(parent);
            (*parent).as_node().unlock();
            RemoveResult::NewRoot(pull_up)
        } else {
            // Deeper layer: rewire the upper layer's slot to the sibling.
            let parent_index = (*upper).find_next_layer_index((*parent).as_node_ptr());
            (*pull_up).set_is_root(true);
            (*pull_up).set_parent(ptr::null_mut());
            (*pull_up).set_upper_layer(upper);
            (*upper).set_lv_next_layer(parent_index, pull_up);
            (*border).connect_prev_and_next();
            (*border).as_node().set_deleted(true);
            gc.add_border(border);
            (*border).as_node().unlock();
            (*parent).as_node().set_deleted(true);
            gc.add_interior(parent);
            (*parent).as_node().unlock();
            (*upper).as_node().unlock();
            RemoveResult::NewRoot(pull_up)
        }
    } else {
        // The drained parent is interior to its layer; splice the sibling
        // into the grandparent.
        let grandparent = (*parent).as_node().locked_parent();
        debug_assert!(!grandparent.is_null());
        let parent_index = (*grandparent).find_child_index((*parent).as_node_ptr());
        (*grandparent).set_child(parent_index, pull_up);
        (*pull_up).set_parent(grandparent);
        (*border).connect_prev_and_next();
        (*border).as_node().set_deleted(true);
        gc.add_border(border);
        (*border).as_node().unlock();
        (*parent).as_node().set_deleted(true);
        gc.add_interior(parent);
        (*parent).as_node().unlock();
        (*grandparent).as_node().unlock();
        RemoveResult::Done
    }
}

/// Remove `key` within one layer, recursing into deeper layers as needed.
///
/// The caller owns the record the removed slot pointed at; the index only
/// drops its reference.
///
/// # Safety
/// `root` is a live layer root under the epoch-deferred reclamation rule.
pub(crate) unsafe fn remove(
    root: *mut Node,
    key: &mut Key,
    gc: &mut GarbageCollector,
) -> RemoveResult {
    'retry: loop {
        let (border, _) = find_border(root, key);
        (*border).as_node().lock();
        let mut version = (*border).as_node().version();
        let mut border = border;
        'forward: loop {
            debug_assert!((*border).as_node().is_locked());
            if version.deleted() {
                (*border).as_node().unlock();
                if version.is_root() {
                    // A concurrent removal emptied this layer already.
                    return RemoveResult::Done;
                }
                continue 'retry;
            }
            let result = (*border).search_link_or_value(key);
            if Version::split_happened(version, (*border).as_node().version()) {
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
                    (*border).as_node().unlock();
                    return RemoveResult::NotFound;
                },
                BorderSearch::Value { index, .. } => {
                    let mut permutation = (*border).permutation();
                    if (*border).as_node().version().is_root()
                        && permutation.num_keys() == 1
                        && key.cursor != 0
                    {
                        handle_delete_layer(border, gc);
                        return RemoveResult::LayerDeleted;
                    }
                    (*border).mark_key_removed(index);
                    // Drop the slot's payload references now; the record
                    // itself belongs to the caller.
                    (*border).set_lv_raw(index, 0);
                    let suffix = (*border).suffix(index);
                    if !suffix.is_null() {
                        gc.add_suffix(suffix);
                        (*border).set_suffix(index, ptr::null_mut());
                    }
                    permutation.remove_index(index);
                    (*border).set_permutation(permutation);
                    if permutation.num_keys() == 0 {
                        return delete_border_node(border, gc);
                    }
                    (*border).as_node().unlock();
                    return RemoveResult::Done;
                },
                BorderSearch::Layer { next_layer, .. } => {
                    (*border).as_node().unlock();
                    key.next();
                    match remove(next_layer, key, gc) {
                        RemoveResult::LayerDeleted => {
                            key.back();
                            continue 'retry;
                        },
                        RemoveResult::NotFound => return RemoveResult::NotFound,
                        // Sub-layer root changes were wired into our slot by
                        // the recursion itself.
                        RemoveResult::Done | RemoveResult::NewRoot(_) => {
                            return RemoveResult::Done
                        },
                    }
                },
                BorderSearch::Unstable => {
                    unreachable!("unstable slot observed while holding the border lock")
                },
            }
        }
    }
}
