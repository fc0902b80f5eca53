use common::Record;

use crate::{
    key::Key,
    node::{
        find_border,
        BorderSearch,
        Node,
    },
    version::Version,
};

pub(crate) enum GetOutcome {
    Found(*const Record),
    NotFound,
    /// The layer root we landed on was deleted; restart from layer 0 in
    /// case the key was relocated upward by a layer collapse.
    RetryFromUpperLayer,
}

/// Lock-free point lookup within one layer tree, descending into deeper
/// layers as directed.
///
/// # Safety
/// `root` must be a live layer root; all pointers observed stay live under
/// the epoch-deferred reclamation rule.
pub(crate) unsafe fn get(mut root: *mut Node, key: &mut Key) -> GetOutcome {
    'retry: loop {
        let (mut border, mut version) = find_border(root, key);
        'forward: loop {
            if version.deleted() {
                if version.is_root() {
                    return GetOutcome::RetryFromUpperLayer;
                }
                continue 'retry;
            }
            let result = (*border).search_link_or_value(key);
            if (*border).as_node().version().xor(version) > Version::HAS_LOCKED {
                // The border changed under the search. If it split, our key
                // may have moved to the right; chase the leaf links.
                version = (*border).as_node().stable_version();
                let mut next = (*border).next();
                while !version.deleted()
                    && !next.is_null()
                    && key.current_slice().slice >= (*next).lowest_key()
                {
                    border = next;
                    version = (*border).as_node().stable_version();
                    next = (*border).next();
                }
                continue 'forward;
            }
            match result {
                BorderSearch::NotFound => return GetOutcome::NotFound,
                BorderSearch::Value { record, .. } => return GetOutcome::Found(record),
                BorderSearch::Layer { next_layer, .. } => {
                    root = next_layer;
                    key.next();
                    continue 'retry;
                },
                BorderSearch::Unstable => continue 'forward,
            }
        }
    }
}
