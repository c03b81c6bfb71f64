//! Turn before/after snapshots of the document into operations.
//!
//! Hosts report one contiguous change per notification. The diff trims the
//! common prefix and suffix, so the result reproduces `new` exactly for any
//! pair of strings; when several disjoint regions changed at once they are
//! covered by a single hunk spanning from the first to the last change.

use super::operation::{char_len, TextOperation};

/// Operations that turn `old` into `new`, in application order.
///
/// Ids, author and timestamp are left for the caller to assign.
pub fn generate_operations(old: &str, new: &str) -> Vec<TextOperation> {
    if old == new {
        return Vec::new();
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(new_chars.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let removed: String = old_chars[prefix..old_chars.len() - suffix].iter().collect();
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    let mut ops = Vec::with_capacity(2);
    if !removed.is_empty() {
        ops.push(TextOperation::delete(prefix, char_len(&removed)).with_deleted_text(removed));
    }
    if !inserted.is_empty() {
        ops.push(TextOperation::insert(prefix, inserted));
    }
    ops
}
