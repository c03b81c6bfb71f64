//! Attribution of document spans to the peer who wrote them.
//!
//! Ranges are half-open, disjoint and kept sorted by start. Operations must
//! be recorded in exactly the order they were applied to the text, otherwise
//! the ranges drift away from the characters they describe.

use std::ops::Range;

use super::operation::{OperationKind, TextOperation};
use super::UserId;

/// `[start, end)` written by `user_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorshipRange {
    pub start: usize,
    pub end: usize,
    pub user_id: UserId,
}

impl AuthorshipRange {
    pub fn new(start: usize, end: usize, user_id: impl Into<String>) -> Self {
        Self {
            start,
            end,
            user_id: user_id.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn span(&self) -> Range<usize> {
        self.start..self.end
    }

    fn overlaps(&self, other: &Range<usize>) -> bool {
        self.start < other.end && self.end > other.start
    }
}

/// A rendering segment: a span and its author, `None` for unattributed text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorshipSegment<'a> {
    pub span: Range<usize>,
    pub user_id: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthorshipTracker {
    ranges: Vec<AuthorshipRange>,
}

impl AuthorshipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update ranges for an operation that has just been applied
    pub fn record_operation(&mut self, op: &TextOperation) {
        if op.user_id.is_empty() || op.length == 0 {
            return;
        }

        match op.kind {
            OperationKind::Insert { .. } => self.record_insert(op.position, op.length, &op.user_id),
            OperationKind::Delete { .. } => self.record_delete(op.position, op.length),
        }
    }

    fn record_insert(&mut self, position: usize, length: usize, user_id: &str) {
        let mut before = Vec::with_capacity(self.ranges.len() + 2);
        let mut after = Vec::new();

        for range in self.ranges.drain(..) {
            if range.end <= position {
                before.push(range);
            } else if range.start >= position {
                after.push(AuthorshipRange::new(
                    range.start + length,
                    range.end + length,
                    range.user_id,
                ));
            } else {
                // Straddles the insertion point: split around the new text.
                before.push(AuthorshipRange::new(range.start, position, range.user_id.clone()));
                after.push(AuthorshipRange::new(
                    position + length,
                    range.end + length,
                    range.user_id,
                ));
            }
        }

        before.push(AuthorshipRange::new(position, position + length, user_id));
        before.extend(after);
        self.ranges = before;
        self.merge_adjacent();
    }

    fn record_delete(&mut self, position: usize, length: usize) {
        let end = position + length;

        self.ranges = self
            .ranges
            .drain(..)
            .filter_map(|range| {
                if range.end <= position {
                    Some(range)
                } else if range.start >= end {
                    Some(AuthorshipRange::new(
                        range.start - length,
                        range.end - length,
                        range.user_id,
                    ))
                } else {
                    let start = range.start.min(position);
                    let new_end = if range.end > end { range.end - length } else { position };
                    (new_end > start).then(|| AuthorshipRange::new(start, new_end, range.user_id))
                }
            })
            .collect();
        self.merge_adjacent();
    }

    fn merge_adjacent(&mut self) {
        let mut merged: Vec<AuthorshipRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end == range.start && last.user_id == range.user_id => {
                    last.end = range.end;
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    /// Ranges overlapping `span`, ordered by start
    pub fn ranges_in(&self, span: Range<usize>) -> Vec<&AuthorshipRange> {
        self.ranges.iter().filter(|r| r.overlaps(&span)).collect()
    }

    pub fn ranges(&self) -> &[AuthorshipRange] {
        &self.ranges
    }

    /// Author of the character at `position`
    pub fn author_at(&self, position: usize) -> Option<&str> {
        let idx = self.ranges.partition_point(|r| r.end <= position);
        self.ranges
            .get(idx)
            .filter(|r| r.start <= position)
            .map(|r| r.user_id.as_str())
    }

    /// Split `0..doc_len` into attributed and unattributed segments
    pub fn segments(&self, doc_len: usize) -> Vec<AuthorshipSegment<'_>> {
        let mut segments = Vec::with_capacity(self.ranges.len() * 2 + 1);
        let mut cursor = 0;

        for range in &self.ranges {
            if range.start >= doc_len {
                break;
            }
            if cursor < range.start {
                segments.push(AuthorshipSegment {
                    span: cursor..range.start,
                    user_id: None,
                });
            }
            let end = range.end.min(doc_len);
            segments.push(AuthorshipSegment {
                span: range.start..end,
                user_id: Some(&range.user_id),
            });
            cursor = end;
        }

        if cursor < doc_len {
            segments.push(AuthorshipSegment {
                span: cursor..doc_len,
                user_id: None,
            });
        }
        segments
    }

    /// Total attributed characters
    pub fn covered_len(&self) -> usize {
        self.ranges.iter().map(AuthorshipRange::len).sum()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
