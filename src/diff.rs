//! Catalog comparison: tolerant entry equality and the one-way diff

use crate::catalog::FileEntry;
use std::collections::HashMap;

/// Tolerant equality rule for catalog entries.
///
/// `name`, `path`, and `size` must match exactly, except that directory
/// sizes are filesystem noise and carry no meaning. Hashes are compared
/// only when both sides carry one, so a hash-disabled scan still gets a
/// (weaker) size+path comparison. Modification time is never compared -
/// touching a file without changing content is not a change, and the
/// timestamp does not survive the wire reliably anyway.
pub fn entries_equal(a: &FileEntry, b: &FileEntry) -> bool {
    if a.name != b.name {
        return false;
    }
    if a.path != b.path {
        return false;
    }
    if !(a.is_dir() && b.is_dir()) && a.size != b.size {
        return false;
    }
    if !a.hash.is_empty() && !b.hash.is_empty() && a.hash != b.hash {
        return false;
    }
    true
}

/// Subset of `all` that the holder of `reference` does not already have
/// in equivalent form.
///
/// One-way: entries present only in `reference` are never reported, so
/// files deleted on the sender accumulate on the receiver. Result order
/// follows `all`.
pub fn missing(all: &[FileEntry], reference: &[FileEntry]) -> Vec<FileEntry> {
    let by_path: HashMap<&str, &FileEntry> =
        reference.iter().map(|e| (e.path.as_str(), e)).collect();
    all.iter()
        .filter(|entry| match by_path.get(entry.path.as_str()) {
            Some(have) => !entries_equal(entry, have),
            None => true,
        })
        .cloned()
        .collect()
}
