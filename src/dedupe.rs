//! Dedupe hooks that can be attached to `BatchQueue` with `Builder::dedupe`.
//!
//! Hook is run by the worker over the whole pending buffer after every appended item.
//! It rewrites the buffer in place; the queue then checks size limit against the rewritten buffer.
use linked_hash_map::LinkedHashMap;
use std::hash::Hash;

/// Boxed dedupe hook as stored by the worker.
pub type Dedupe<I> = Box<dyn FnMut(&mut Vec<I>) + Send>;

/// Removes duplicate items keeping the first occurrence of each value in order they were appended.
///
/// ```rust
/// let mut items = vec![3, 1, 3, 2, 1];
/// batch_queue::dedupe::first_seen(&mut items);
/// assert_eq!(items, [3, 1, 2]);
/// ```
pub fn first_seen<I: Hash + Eq>(items: &mut Vec<I>) {
    // Nothing to do for a single item; this is the common case right after a flush
    if items.len() < 2 {
        return;
    }

    let mut seen = LinkedHashMap::with_capacity(items.len());
    for item in items.drain(..) {
        // Insertion of known key would move it to the back
        if !seen.contains_key(&item) {
            seen.insert(item, ());
        }
    }

    items.extend(seen.into_iter().map(|(item, ())| item));
}
