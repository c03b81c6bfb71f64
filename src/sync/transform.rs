//! Operational transform rules for concurrent inserts and deletes.
//!
//! `transform(a, b)` rewrites `a` so it can be applied to a document that
//! already has `b` applied, where `a` and `b` were generated against the
//! same document without seeing each other. For any such pair
//!
//! ```text
//! apply(apply(D, a), transform(b, a)) == apply(apply(D, b), transform(a, b))
//! ```
//!
//! Exact insert ties are broken by `(user_id, operation_id)` so both peers
//! pick the same order.

use super::operation::{OperationKind, TextOperation};

/// Result of transforming one operation against another
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    /// Everything the operation wanted to do has already happened
    Superseded,
    Single(TextOperation),
    /// A delete cut in two by a concurrent insertion. The second piece is
    /// expressed against the document after the first has been applied.
    Split(TextOperation, TextOperation),
}

impl Transformed {
    pub fn is_superseded(&self) -> bool {
        matches!(self, Transformed::Superseded)
    }

    pub fn into_vec(self) -> Vec<TextOperation> {
        match self {
            Transformed::Superseded => Vec::new(),
            Transformed::Single(op) => vec![op],
            Transformed::Split(first, second) => vec![first, second],
        }
    }
}

/// Transform `a` against concurrent `b` (which is applied first)
pub fn transform(a: &TextOperation, b: &TextOperation) -> Transformed {
    if a.length == 0 {
        return Transformed::Superseded;
    }
    if b.length == 0 {
        return Transformed::Single(a.clone());
    }

    match (&a.kind, &b.kind) {
        (OperationKind::Insert { .. }, OperationKind::Insert { .. }) => {
            if a.position < b.position || (a.position == b.position && wins_tie(a, b)) {
                Transformed::Single(a.clone())
            } else {
                Transformed::Single(a.moved_to(a.position.saturating_add(b.length)))
            }
        }

        (OperationKind::Delete { .. }, OperationKind::Insert { .. }) => {
            if b.position <= a.position {
                Transformed::Single(a.moved_to(a.position.saturating_add(b.length)))
            } else if b.position >= a.end() {
                Transformed::Single(a.clone())
            } else {
                // Keep the inserted text alive: delete around it.
                let before = b.position - a.position;
                Transformed::Split(
                    a.with_span(a.position, before),
                    a.with_span(a.position.saturating_add(b.length), a.length - before),
                )
            }
        }

        (OperationKind::Insert { .. }, OperationKind::Delete { .. }) => {
            if a.position <= b.position {
                Transformed::Single(a.clone())
            } else if a.position <= b.end() {
                Transformed::Single(a.moved_to(b.position))
            } else {
                Transformed::Single(a.moved_to(a.position - b.length))
            }
        }

        (OperationKind::Delete { .. }, OperationKind::Delete { .. }) => {
            if a.end() <= b.position {
                Transformed::Single(a.clone())
            } else if a.position >= b.end() {
                Transformed::Single(a.moved_to(a.position - b.length))
            } else {
                resolve_overlapping_deletes(a, b)
            }
        }
    }
}

/// `a` and `b` delete overlapping spans; keep only what `b` did not remove.
fn resolve_overlapping_deletes(a: &TextOperation, b: &TextOperation) -> Transformed {
    let overlap = a.end().min(b.end()) - a.position.max(b.position);
    let remaining = a.length - overlap;

    if remaining == 0 {
        Transformed::Superseded
    } else {
        Transformed::Single(a.with_span(a.position.min(b.position), remaining))
    }
}

fn wins_tie(a: &TextOperation, b: &TextOperation) -> bool {
    (a.user_id.as_str(), a.operation_id) <= (b.user_id.as_str(), b.operation_id)
}

/// Transform a sequence of operations against another concurrent sequence.
///
/// Both inputs are sequential (each operation applies to the result of the
/// previous one) and start from the same document. Returns `ops` rebased to
/// apply after `against`, and `against` rebased to apply after `ops`.
pub fn transform_sequence(
    ops: &[TextOperation],
    against: &[TextOperation],
) -> (Vec<TextOperation>, Vec<TextOperation>) {
    if ops.is_empty() || against.is_empty() {
        return (ops.to_vec(), against.to_vec());
    }

    if ops.len() > 1 {
        let (head, tail) = ops.split_at(1);
        let (mut head_t, against_t) = transform_sequence(head, against);
        let (tail_t, against_tt) = transform_sequence(tail, &against_t);
        head_t.extend(tail_t);
        return (head_t, against_tt);
    }

    if against.len() > 1 {
        let (head, tail) = against.split_at(1);
        let (ops_t, mut head_t) = transform_sequence(ops, head);
        let (ops_tt, tail_t) = transform_sequence(&ops_t, tail);
        head_t.extend(tail_t);
        return (ops_tt, head_t);
    }

    let (op, other) = (&ops[0], &against[0]);
    (
        transform(op, other).into_vec(),
        transform(other, op).into_vec(),
    )
}
