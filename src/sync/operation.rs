//! Atomic text edits addressed by character offset.
//!
//! Offsets and lengths count Unicode scalar values, never bytes. Every
//! operation is expressed against the document exactly as it was before the
//! operation was generated.

use tracing::warn;

use super::{OperationId, UserId};

/// What an operation does to the text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Splice `text` in at the operation position
    Insert { text: String },
    /// Remove `length` characters starting at the operation position.
    /// `deleted_text` is informational and only present when known exactly.
    Delete { deleted_text: Option<String> },
}

/// A single insert or delete produced by one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextOperation {
    pub kind: OperationKind,
    /// Character offset into the document before this operation
    pub position: usize,
    /// Characters affected (inserted text length for inserts)
    pub length: usize,
    /// Monotonic per-peer identifier assigned at generation time
    pub operation_id: OperationId,
    /// Originating peer
    pub user_id: UserId,
    /// Wall clock milliseconds at generation, advisory only
    pub timestamp: i64,
    /// Shared by the operations that make up one logical edit
    pub edit_id: Option<OperationId>,
}

impl TextOperation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            length: char_len(&text),
            kind: OperationKind::Insert { text },
            position,
            operation_id: 0,
            user_id: UserId::new(),
            timestamp: 0,
            edit_id: None,
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            kind: OperationKind::Delete { deleted_text: None },
            position,
            length,
            operation_id: 0,
            user_id: UserId::new(),
            timestamp: 0,
            edit_id: None,
        }
    }

    pub fn with_deleted_text(mut self, deleted: impl Into<String>) -> Self {
        if let OperationKind::Delete { deleted_text } = &mut self.kind {
            *deleted_text = Some(deleted.into());
        }
        self
    }

    pub fn with_author(mut self, user_id: impl Into<String>, operation_id: OperationId) -> Self {
        self.user_id = user_id.into();
        self.operation_id = operation_id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_edit_id(mut self, edit_id: OperationId) -> Self {
        self.edit_id = Some(edit_id);
        self
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OperationKind::Insert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, OperationKind::Delete { .. })
    }

    /// Inserted text, if this is an insert
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            OperationKind::Insert { text } => Some(text),
            OperationKind::Delete { .. } => None,
        }
    }

    /// First offset past the affected span, saturating at `usize::MAX`
    pub fn end(&self) -> usize {
        self.position.saturating_add(self.length)
    }

    /// Same operation moved to `position`
    pub fn moved_to(&self, position: usize) -> Self {
        Self {
            position,
            ..self.clone()
        }
    }

    /// Same delete narrowed to a different span. The recorded deleted text no
    /// longer matches, so it is dropped.
    pub fn with_span(&self, position: usize, length: usize) -> Self {
        let kind = match &self.kind {
            OperationKind::Delete { .. } => OperationKind::Delete { deleted_text: None },
            insert => insert.clone(),
        };
        Self {
            kind,
            position,
            length,
            ..self.clone()
        }
    }

    /// Apply to `doc`, clamping out-of-range positions instead of failing.
    ///
    /// Returns the operation as it actually took effect, or `None` when it
    /// changed nothing.
    pub fn apply_to(&self, doc: &mut String) -> Option<TextOperation> {
        let doc_len = char_len(doc);

        match &self.kind {
            OperationKind::Insert { text } => {
                if text.is_empty() {
                    return None;
                }
                let position = if self.position > doc_len {
                    warn!(
                        "Insert position {} beyond document length {}, clamping",
                        self.position, doc_len
                    );
                    doc_len
                } else {
                    self.position
                };
                doc.insert_str(byte_index(doc, position), text);
                Some(self.moved_to(position))
            }
            OperationKind::Delete { .. } => {
                let position = self.position.min(doc_len);
                let length = self.length.min(doc_len - position);
                if position != self.position || length != self.length {
                    warn!(
                        "Delete [{}, {}) outside document length {}, clamping to [{}, {})",
                        self.position,
                        self.end(),
                        doc_len,
                        position,
                        position + length
                    );
                }
                if length == 0 {
                    return None;
                }
                let start = byte_index(doc, position);
                let end = byte_index(doc, position + length);
                let removed: String = doc.drain(start..end).collect();

                let mut applied = self.clone();
                applied.position = position;
                applied.length = length;
                applied.kind = OperationKind::Delete {
                    deleted_text: Some(removed),
                };
                Some(applied)
            }
        }
    }
}

/// Number of characters in `s`
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the character at `char_pos`, or `s.len()` past the end
pub(crate) fn byte_index(s: &str, char_pos: usize) -> usize {
    s.char_indices()
        .nth(char_pos)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len())
}

/// Apply operations in order, returning the resulting text
pub fn apply_all<'a>(doc: &str, ops: impl IntoIterator<Item = &'a TextOperation>) -> String {
    let mut out = doc.to_string();
    for op in ops {
        op.apply_to(&mut out);
    }
    out
}
