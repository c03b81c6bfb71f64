//! Local operations sent to the relay but not yet acknowledged.
//!
//! These are the edits a remote peer could not have seen when it generated
//! its own operation, so every incoming remote operation is transformed
//! against them, in the order they were generated. Each entry is kept rebased
//! onto the remote operations applied since it was sent, so the next remote
//! operation is transformed against the current document frame.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::operation::TextOperation;
use super::transform::transform_sequence;
use super::OperationId;

#[derive(Debug, Clone)]
pub struct PendingOperation {
    /// The operation exactly as it was sent
    pub original: TextOperation,
    /// The same edit expressed against the current document. May be split in
    /// two, or empty once a remote delete has already removed its effect.
    pub rebased: Vec<TextOperation>,
    pub sent_at: Instant,
}

/// Ordered by operation id, which is also generation order
#[derive(Debug, Default)]
pub struct PendingOperationBuffer {
    entries: BTreeMap<OperationId, PendingOperation>,
}

impl PendingOperationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly sent local operation
    pub fn insert(&mut self, op: TextOperation) {
        let id = op.operation_id;
        let entry = PendingOperation {
            rebased: vec![op.clone()],
            original: op,
            sent_at: Instant::now(),
        };
        if self.entries.insert(id, entry).is_some() {
            warn!("Pending operation {} replaced by a newer one with the same id", id);
        }
    }

    /// Drop an acknowledged operation. Unknown ids are ignored.
    pub fn acknowledge(&mut self, operation_id: OperationId) -> Option<PendingOperation> {
        let removed = self.entries.remove(&operation_id);
        if removed.is_none() {
            debug!("Ack for unknown or already acknowledged operation {}", operation_id);
        }
        removed
    }

    /// Transform a remote operation against every pending operation in
    /// generation order, rebasing the pending entries over it.
    ///
    /// Returns what should be applied to the local document, which may be
    /// empty when the remote edit has nothing left to do.
    pub fn transform_incoming(&mut self, remote: &TextOperation) -> Vec<TextOperation> {
        let mut incoming = vec![remote.clone()];

        for entry in self.entries.values_mut() {
            if incoming.is_empty() {
                break;
            }
            let (incoming_t, rebased_t) = transform_sequence(&incoming, &entry.rebased);
            incoming = incoming_t;
            entry.rebased = rebased_t;
        }

        incoming
    }

    /// Remove entries sent more than `timeout` before `now`
    pub fn expire_older_than(&mut self, timeout: Duration, now: Instant) -> Vec<OperationId> {
        let expired: Vec<OperationId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    pub fn contains(&self, operation_id: OperationId) -> bool {
        self.entries.contains_key(&operation_id)
    }

    pub fn get(&self, operation_id: OperationId) -> Option<&PendingOperation> {
        self.entries.get(&operation_id)
    }

    /// Entries in generation order
    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.entries.values()
    }

    pub fn ids(&self) -> Vec<OperationId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
