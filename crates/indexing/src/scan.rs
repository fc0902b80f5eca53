use common::Record;

use crate::{
    key::Key,
    node::{
        find_border,
        find_leftmost_border,
        Node,
        KEY_LEN_HAS_SUFFIX,
        KEY_LEN_LAYER,
        KEY_LEN_UNSTABLE,
    },
    suffix::BigSuffix,
    version::Version,
};

/// A concurrent split or delete invalidated the borders the scan was
/// walking; the top-level entry point restarts.
pub(crate) struct ScanRace;

pub(crate) enum ScanControl {
    /// This layer is exhausted; the caller keeps going.
    Continue,
    /// The right bound was passed; the whole scan is complete.
    Done,
}

struct ScanEntry {
    slice: u64,
    key_len: u8,
    lv: usize,
    suffix: Option<BigSuffix>,
}

/// Depth-first scan of one layer. `current_key` carries the slices of the
/// layers above; `current_key.cursor` is this layer's depth.
///
/// Entries are snapshotted border-by-border and validated against the
/// border's version before use, so no partially installed slot is ever
/// emitted.
///
/// # Safety
/// `root` is a live layer root under the epoch-deferred reclamation rule.
pub(crate) unsafe fn scan_layer(
    root: *mut Node,
    at_top: bool,
    current_key: &mut Key,
    left: &Key,
    l_exclusive: bool,
    right: &Key,
    r_exclusive: bool,
    out: &mut Vec<(Key, *const Record)>,
) -> Result<ScanControl, ScanRace> {
    let (mut border, _) = if at_top {
        find_border(root, left)
    } else {
        // Deeper layers are entered from a slot already known to be within
        // range; start from their smallest key and let the bound checks
        // filter.
        find_leftmost_border(root)
    };

    loop {
        let version = (*border).as_node().stable_version();
        if version.deleted() {
            return Err(ScanRace);
        }
        let permutation = (*border).permutation();
        let mut entries = Vec::with_capacity(permutation.num_keys());
        for i in 0..permutation.num_keys() {
            let true_index = permutation.key_index(i);
            if (*border).is_key_removed(true_index) {
                continue;
            }
            let key_len = (*border).key_len(true_index);
            if key_len == 0 {
                continue;
            }
            if key_len == KEY_LEN_UNSTABLE {
                return Err(ScanRace);
            }
            let suffix = if key_len == KEY_LEN_HAS_SUFFIX {
                let suffix = (*border).suffix(true_index);
                if suffix.is_null() {
                    return Err(ScanRace);
                }
                Some((*suffix).clone())
            } else {
                None
            };
            entries.push(ScanEntry {
                slice: (*border).key_slice(true_index),
                key_len,
                lv: (*border).lv_raw(true_index),
                suffix,
            });
        }
        let next = (*border).next();
        if (*border).as_node().version().xor(version) > Version::HAS_LOCKED {
            return Err(ScanRace);
        }

        for entry in entries {
            // Rebuild the key for this entry from the layer prefix.
            current_key.slices.truncate(current_key.cursor);
            current_key.slices.push(entry.slice);
            current_key.last_slice_size = match entry.key_len {
                KEY_LEN_HAS_SUFFIX | KEY_LEN_LAYER => 8,
                len => len,
            };
            if let Some(suffix) = &entry.suffix {
                current_key.slices.extend_from_slice(suffix.slices());
                current_key.last_slice_size = suffix.last_slice_size();
            }

            if entry.key_len == KEY_LEN_LAYER {
                // Every key below this slot strictly extends the prefix, so
                // the layer holds in-range keys iff the prefix is below the
                // right bound.
                if *current_key >= *right {
                    return Ok(ScanControl::Done);
                }
                let layer_root = entry.lv as *mut Node;
                current_key.cursor += 1;
                let control = scan_layer(
                    layer_root,
                    false,
                    current_key,
                    left,
                    l_exclusive,
                    right,
                    r_exclusive,
                    out,
                );
                current_key.cursor -= 1;
                match control? {
                    ScanControl::Done => return Ok(ScanControl::Done),
                    ScanControl::Continue => continue,
                }
            }

            if *current_key < *left || (l_exclusive && *current_key == *left) {
                continue;
            }
            if *right < *current_key || (r_exclusive && *current_key == *right) {
                return Ok(ScanControl::Done);
            }
            let mut emitted = current_key.clone();
            emitted.reset();
            out.push((emitted, entry.lv as *const Record));
        }

        if next.is_null() {
            return Ok(ScanControl::Continue);
        }
        border = next;
    }
}
