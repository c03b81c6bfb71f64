//! A peer's view of one collaboratively edited document.
//!
//! `CollaborationSession` owns the authoritative local text and drives the
//! whole protocol: local edits are diffed into operations, echoed locally at
//! once and parked in the pending buffer until the relay acknowledges them;
//! remote operations are transformed against that buffer before they touch
//! the text. Everything the host needs to re-render is published as
//! [`SessionEvent`]s.
//!
//! The session is single-owner and synchronous. Hosts read
//! [`TransportEvent`]s from their transport and pass each one to
//! [`CollaborationSession::handle_transport_event`].

use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::authorship::AuthorshipTracker;
use super::diff::generate_operations;
use super::operation::{char_len, TextOperation};
use super::pending::PendingOperationBuffer;
use super::presence::{color_for_user, generate_user_name, CursorState, PresenceRoster, UserInfo};
use super::protocol::{CursorUpdate, ProtocolMessage, RelayControl, UserJoin, UserLeave};
use super::{generate_user_id, OperationId, SessionConfig, SyncError, SyncResult, UserId};
use crate::transport::{Transport, TransportEvent};

/// Events published to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A remote operation changed the text; `cursor` is the adjusted local caret
    DocumentChanged {
        content: String,
        cursor: CursorState,
        author: UserId,
    },
    RemoteCursorMoved {
        user_id: UserId,
        cursor: CursorState,
    },
    UserJoined(UserInfo),
    UserLeft {
        user_id: UserId,
        name: String,
    },
    Connected,
    Disconnected {
        reason: String,
    },
    RelayPeerJoined {
        connection_id: String,
        user_count: usize,
    },
    RelayPeerLeft {
        connection_id: String,
        user_count: usize,
    },
    RelayError {
        message: String,
    },
    /// The transport gave up reconnecting
    ConnectionFailed {
        attempts: u32,
    },
    /// Unacknowledged operations dropped after the ack timeout
    PendingExpired {
        operation_ids: Vec<OperationId>,
    },
}

/// Snapshot of session counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub local_user_id: UserId,
    pub connected_users: usize,
    pub operations_applied: usize,
    pub remote_operations_applied: u64,
    pub pending_operations: usize,
    pub cursors_visible: usize,
    pub authorship_enabled: bool,
    pub authorship_ranges: usize,
    pub relay_connection_id: Option<String>,
    pub relay_user_count: usize,
}

/// What the relay has told us about the room
#[derive(Debug, Default)]
struct RelayStatus {
    connected: bool,
    connection_id: Option<String>,
    user_count: usize,
}

pub struct CollaborationSession<T: Transport> {
    config: SessionConfig,
    transport: T,
    identity: UserInfo,
    content: String,
    local_cursor: CursorState,
    local_operation_id: OperationId,
    remote_operation_id: u64,
    pending: PendingOperationBuffer,
    authorship: AuthorshipTracker,
    roster: PresenceRoster,
    history: Vec<TextOperation>,
    relay: RelayStatus,
    events: broadcast::Sender<SessionEvent>,
    started: bool,
    closed: bool,
}

impl<T: Transport> CollaborationSession<T> {
    /// Create a session with a fresh identity
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let user_id = generate_user_id();
        let name = config.user_name.clone().unwrap_or_else(generate_user_name);
        let color = color_for_user(&user_id);
        let identity = UserInfo::new(user_id, name, color);
        Self::with_identity(transport, config, identity)
    }

    /// Create a session for an existing identity
    pub fn with_identity(transport: T, config: SessionConfig, identity: UserInfo) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            transport,
            identity,
            content: String::new(),
            local_cursor: CursorState::default(),
            local_operation_id: 0,
            remote_operation_id: 0,
            pending: PendingOperationBuffer::new(),
            authorship: AuthorshipTracker::new(),
            roster: PresenceRoster::new(),
            history: Vec::new(),
            relay: RelayStatus::default(),
            events,
            started: false,
            closed: false,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Load the starting snapshot and announce ourselves to the room
    pub fn start(&mut self, initial_content: impl Into<String>) -> SyncResult<()> {
        self.ensure_open()?;
        self.content = initial_content.into();
        self.local_cursor = CursorState::at(char_len(&self.content));
        self.started = true;

        info!(
            "Session started for {} ({}) with {} characters",
            self.identity.name,
            self.identity.user_id,
            char_len(&self.content)
        );
        self.announce();
        Ok(())
    }

    /// Publish a local change. `new_content` is the full text after the edit.
    ///
    /// Returns the operations that were sent, empty when nothing changed.
    pub fn local_edit(
        &mut self,
        new_content: &str,
        cursor: CursorState,
    ) -> SyncResult<Vec<TextOperation>> {
        self.ensure_open()?;

        let ops = generate_operations(&self.content, new_content);
        let edit_id = (ops.len() > 1).then_some(self.local_operation_id + 1);
        let timestamp = chrono::Utc::now().timestamp_millis();
        let mut sent = Vec::with_capacity(ops.len());

        for op in ops {
            self.local_operation_id += 1;
            let mut op = op
                .with_author(self.identity.user_id.clone(), self.local_operation_id)
                .with_timestamp(timestamp);
            if let Some(edit_id) = edit_id {
                op = op.with_edit_id(edit_id);
            }

            let Some(applied) = op.apply_to(&mut self.content) else {
                continue;
            };
            self.pending.insert(applied.clone());
            self.transport.send(ProtocolMessage::operation(&applied));
            self.record(&applied);
            sent.push(applied);
        }

        if !sent.is_empty() {
            debug!("Sent {} local operations", sent.len());
        }
        self.move_cursor(cursor);
        Ok(sent)
    }

    /// Update and broadcast the local caret
    pub fn move_cursor(&mut self, cursor: CursorState) {
        if self.closed {
            return;
        }
        self.local_cursor = cursor;
        self.transport.send(ProtocolMessage::Cursor(CursorUpdate::from_state(
            self.identity.user_id.clone(),
            &cursor,
        )));
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.closed {
            return;
        }

        match event {
            TransportEvent::Connected => {
                self.relay.connected = true;
                self.emit(SessionEvent::Connected);
            }
            TransportEvent::Message { message, .. } => self.handle_message(message),
            TransportEvent::Relay(control) => self.handle_relay_control(control),
            TransportEvent::Disconnected { reason } => {
                self.relay.connected = false;
                info!("Relay connection lost: {}", reason);
                self.emit(SessionEvent::Disconnected { reason });
            }
            TransportEvent::ConnectionFailed { attempts } => {
                self.relay.connected = false;
                warn!("Relay unreachable after {} attempts", attempts);
                self.emit(SessionEvent::ConnectionFailed { attempts });
            }
        }
    }

    /// Dispatch one peer message
    pub fn handle_message(&mut self, message: ProtocolMessage) {
        if self.closed {
            return;
        }

        match message {
            ProtocolMessage::UserJoin(join) => self.handle_user_join(join),
            ProtocolMessage::UserLeave(leave) => self.handle_user_leave(leave),
            ProtocolMessage::Operation(wire) => match wire.into_operations() {
                Ok(ops) => {
                    for op in ops {
                        self.handle_remote_operation(op);
                    }
                }
                Err(e) => warn!("Dropping malformed operation: {}", e),
            },
            ProtocolMessage::OperationAck(ack) => self.handle_operation_ack(ack.operation_id),
            ProtocolMessage::Cursor(update) => self.handle_remote_cursor(update),
        }
    }

    /// Transform a remote operation against our unacknowledged edits and
    /// apply what remains
    pub fn handle_remote_operation(&mut self, op: TextOperation) {
        if op.user_id == self.identity.user_id {
            debug!("Ignoring echo of our own operation {}", op.operation_id);
            return;
        }

        let transformed = self.pending.transform_incoming(&op);
        if transformed.is_empty() {
            debug!(
                "Remote operation {} from {} already covered by local edits",
                op.operation_id, op.user_id
            );
        }

        for piece in transformed {
            self.apply_operation(piece);
        }
        self.remote_operation_id += 1;
    }

    /// Apply an operation already expressed against the current text
    pub fn apply_operation(&mut self, op: TextOperation) -> Option<TextOperation> {
        let applied = op.apply_to(&mut self.content)?;

        self.local_cursor.adjust_for(&applied);
        self.record(&applied);

        self.emit(SessionEvent::DocumentChanged {
            content: self.content.clone(),
            cursor: self.local_cursor,
            author: applied.user_id.clone(),
        });
        Some(applied)
    }

    /// Forget an acknowledged operation. Duplicate or unknown acks are ignored.
    pub fn handle_operation_ack(&mut self, operation_id: OperationId) {
        if self.pending.acknowledge(operation_id).is_some() {
            debug!("Operation {} acknowledged", operation_id);
        }
    }

    /// Store a remote caret as received
    pub fn handle_remote_cursor(&mut self, update: CursorUpdate) {
        if update.user_id == self.identity.user_id {
            return;
        }
        let cursor = update.to_state();
        self.roster.update_cursor(&update.user_id, cursor);
        self.emit(SessionEvent::RemoteCursorMoved {
            user_id: update.user_id,
            cursor,
        });
    }

    pub fn handle_user_join(&mut self, join: UserJoin) {
        if join.user_id == self.identity.user_id {
            return;
        }

        let user = UserInfo::new(join.user_id, join.name, join.color);
        if self.roster.add_user(user.clone()) {
            info!("{} joined the collaboration", user.name);
            self.emit(SessionEvent::UserJoined(user));
            // Let the newcomer learn about us too
            if self.started {
                self.announce();
            }
        }
    }

    pub fn handle_user_leave(&mut self, leave: UserLeave) {
        if let Some(user) = self.roster.remove_user(&leave.user_id) {
            info!("{} left the collaboration", user.name);
            self.emit(SessionEvent::UserLeft {
                user_id: user.user_id,
                name: user.name,
            });
        }
    }

    fn handle_relay_control(&mut self, control: RelayControl) {
        match control {
            RelayControl::Connected { connection_id } => {
                debug!("Relay assigned connection id {}", connection_id);
                self.relay.connection_id = Some(connection_id);
            }
            RelayControl::PeerJoined {
                connection_id,
                user_count,
            } => {
                self.relay.user_count = user_count;
                if !self.is_own_connection(&connection_id) {
                    self.emit(SessionEvent::RelayPeerJoined {
                        connection_id,
                        user_count,
                    });
                }
            }
            RelayControl::PeerLeft {
                connection_id,
                user_count,
            } => {
                self.relay.user_count = user_count;
                if !self.is_own_connection(&connection_id) {
                    self.emit(SessionEvent::RelayPeerLeft {
                        connection_id,
                        user_count,
                    });
                }
            }
            RelayControl::Error { message } => {
                warn!("Relay error: {}", message);
                self.emit(SessionEvent::RelayError { message });
            }
        }
    }

    fn is_own_connection(&self, connection_id: &str) -> bool {
        self.relay.connection_id.as_deref() == Some(connection_id)
    }

    /// Drop pending operations older than the configured ack timeout.
    ///
    /// Does nothing when no timeout is configured.
    pub fn expire_stale_pending(&mut self) -> Vec<OperationId> {
        let Some(timeout) = self.config.ack_timeout else {
            return Vec::new();
        };

        let expired = self.pending.expire_older_than(timeout, Instant::now());
        if !expired.is_empty() {
            warn!(
                "{} operations were never acknowledged within {:?}: {:?}",
                expired.len(),
                timeout,
                expired
            );
            self.emit(SessionEvent::PendingExpired {
                operation_ids: expired.clone(),
            });
        }
        expired
    }

    /// Leave the room and drop all collaboration state
    pub fn disconnect(&mut self, reason: &str) {
        if self.closed {
            return;
        }

        info!("Leaving collaboration: {}", reason);
        if self.started {
            self.transport.send(ProtocolMessage::UserLeave(UserLeave {
                user_id: self.identity.user_id.clone(),
            }));
        }
        self.transport.close();

        self.pending.clear();
        self.roster.clear();
        self.authorship.clear();
        self.history.clear();
        self.relay = RelayStatus::default();
        self.closed = true;
        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            local_user_id: self.identity.user_id.clone(),
            connected_users: self.roster.user_count(),
            operations_applied: self.history.len(),
            remote_operations_applied: self.remote_operation_id,
            pending_operations: self.pending.len(),
            cursors_visible: self.roster.cursor_count(),
            authorship_enabled: self.config.track_authorship,
            authorship_ranges: self.authorship.len(),
            relay_connection_id: self.relay.connection_id.clone(),
            relay_user_count: self.relay.user_count,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn identity(&self) -> &UserInfo {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn local_cursor(&self) -> CursorState {
        self.local_cursor
    }

    pub fn remote_cursor(&self, user_id: &str) -> Option<CursorState> {
        self.roster.cursor(user_id)
    }

    pub fn roster(&self) -> &PresenceRoster {
        &self.roster
    }

    pub fn authorship(&self) -> &AuthorshipTracker {
        &self.authorship
    }

    /// Every operation applied to the local text, in application order
    pub fn history(&self) -> &[TextOperation] {
        &self.history
    }

    pub fn pending(&self) -> &PendingOperationBuffer {
        &self.pending
    }

    pub fn is_connected(&self) -> bool {
        self.relay.connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn announce(&self) {
        self.transport.send(ProtocolMessage::UserJoin(UserJoin {
            user_id: self.identity.user_id.clone(),
            color: self.identity.color.clone(),
            name: self.identity.name.clone(),
        }));
    }

    fn record(&mut self, applied: &TextOperation) {
        if self.config.track_authorship {
            self.authorship.record_operation(applied);
        }
        self.history.push(applied.clone());
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed {
            Err(SyncError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
