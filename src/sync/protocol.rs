//! JSON wire protocol spoken between peers through the relay.
//!
//! Every frame on the socket is a JSON object with a string `type`. Peer
//! messages travel inside the relay envelope
//! `{type, data, peerId, timestamp}`; the relay's own control frames
//! (`connected`, `user-joined`, `user-left`, `error`) carry their fields at
//! the top level. Payload field names are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::operation::{OperationKind, TextOperation};
use super::presence::CursorState;
use super::{OperationId, UserId};

/// Maximum accepted frame size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Peer-to-peer message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    UserJoin,
    UserLeave,
    Operation,
    OperationAck,
    Cursor,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::UserJoin => "user-join",
            MessageType::UserLeave => "user-leave",
            MessageType::Operation => "operation",
            MessageType::OperationAck => "operation-ack",
            MessageType::Cursor => "cursor",
        }
    }
}

impl TryFrom<&str> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user-join" => Ok(MessageType::UserJoin),
            "user-leave" => Ok(MessageType::UserLeave),
            "operation" => Ok(MessageType::Operation),
            "operation-ack" => Ok(MessageType::OperationAck),
            "cursor" => Ok(MessageType::Cursor),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Frame has no message type")]
    MissingType,

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Announces a peer to the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoin {
    pub user_id: UserId,
    pub color: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeave {
    pub user_id: UserId,
}

/// Relay confirmation that an operation was sequenced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationAck {
    pub operation_id: OperationId,
}

/// Caret and selection broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdate {
    pub user_id: UserId,
    pub position: usize,
    #[serde(default)]
    pub selection_end: Option<usize>,
    #[serde(default)]
    pub has_selection: bool,
}

impl CursorUpdate {
    pub fn from_state(user_id: impl Into<String>, cursor: &CursorState) -> Self {
        Self {
            user_id: user_id.into(),
            position: cursor.position,
            selection_end: Some(cursor.selection_end.unwrap_or(cursor.position)),
            has_selection: cursor.has_selection(),
        }
    }

    pub fn to_state(&self) -> CursorState {
        match self.selection_end {
            Some(end) if self.has_selection => CursorState::at(self.position).with_selection(end),
            _ => CursorState::at(self.position),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireOperationType {
    Insert,
    Delete,
    /// Only ever received; local replacements go out as delete + insert
    Replace,
}

/// An operation as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    #[serde(rename = "type")]
    pub op_type: WireOperationType,
    pub position: usize,
    #[serde(default)]
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_text: Option<String>,
    #[serde(default)]
    pub operation_id: OperationId,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_id: Option<OperationId>,
}

impl WireOperation {
    /// Decode into operations. A `replace` becomes a delete followed by an
    /// insert at the same position, linked by `edit_id`.
    pub fn into_operations(self) -> Result<Vec<TextOperation>, ProtocolError> {
        let stamp = |op: TextOperation, edit_id: Option<OperationId>| {
            let op = op
                .with_author(self.user_id.clone(), self.operation_id)
                .with_timestamp(self.timestamp);
            match edit_id {
                Some(id) => op.with_edit_id(id),
                None => op,
            }
        };

        match self.op_type {
            WireOperationType::Insert => {
                let text = self.text.clone().ok_or_else(|| {
                    ProtocolError::InvalidFormat("insert operation without text".to_string())
                })?;
                Ok(vec![stamp(TextOperation::insert(self.position, text), self.edit_id)])
            }
            WireOperationType::Delete => {
                let mut op = TextOperation::delete(self.position, self.length);
                if let Some(deleted) = self.deleted_text.clone() {
                    op = op.with_deleted_text(deleted);
                }
                Ok(vec![stamp(op, self.edit_id)])
            }
            WireOperationType::Replace => {
                let new_text = self.new_text.clone().ok_or_else(|| {
                    ProtocolError::InvalidFormat("replace operation without newText".to_string())
                })?;
                let edit_id = Some(self.edit_id.unwrap_or(self.operation_id));

                let mut ops = Vec::with_capacity(2);
                if self.length > 0 {
                    let mut delete = TextOperation::delete(self.position, self.length);
                    if let Some(old) = self.old_text.clone() {
                        delete = delete.with_deleted_text(old);
                    }
                    ops.push(stamp(delete, edit_id));
                }
                if !new_text.is_empty() {
                    ops.push(stamp(TextOperation::insert(self.position, new_text), edit_id));
                }
                Ok(ops)
            }
        }
    }
}

impl From<&TextOperation> for WireOperation {
    fn from(op: &TextOperation) -> Self {
        let (op_type, text, deleted_text) = match &op.kind {
            OperationKind::Insert { text } => (WireOperationType::Insert, Some(text.clone()), None),
            OperationKind::Delete { deleted_text } => {
                (WireOperationType::Delete, None, deleted_text.clone())
            }
        };
        Self {
            op_type,
            position: op.position,
            length: op.length,
            text,
            deleted_text,
            old_text: None,
            new_text: None,
            operation_id: op.operation_id,
            user_id: op.user_id.clone(),
            timestamp: op.timestamp,
            edit_id: op.edit_id,
        }
    }
}

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    UserJoin(UserJoin),
    UserLeave(UserLeave),
    Operation(WireOperation),
    OperationAck(OperationAck),
    Cursor(CursorUpdate),
}

impl ProtocolMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ProtocolMessage::UserJoin(_) => MessageType::UserJoin,
            ProtocolMessage::UserLeave(_) => MessageType::UserLeave,
            ProtocolMessage::Operation(_) => MessageType::Operation,
            ProtocolMessage::OperationAck(_) => MessageType::OperationAck,
            ProtocolMessage::Cursor(_) => MessageType::Cursor,
        }
    }

    pub fn operation(op: &TextOperation) -> Self {
        ProtocolMessage::Operation(WireOperation::from(op))
    }

    fn payload(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            ProtocolMessage::UserJoin(m) => serde_json::to_value(m)?,
            ProtocolMessage::UserLeave(m) => serde_json::to_value(m)?,
            ProtocolMessage::Operation(m) => serde_json::to_value(m)?,
            ProtocolMessage::OperationAck(m) => serde_json::to_value(m)?,
            ProtocolMessage::Cursor(m) => serde_json::to_value(m)?,
        };
        Ok(value)
    }

    fn from_payload(msg_type: MessageType, payload: Value) -> Result<Self, ProtocolError> {
        let message = match msg_type {
            MessageType::UserJoin => ProtocolMessage::UserJoin(serde_json::from_value(payload)?),
            MessageType::UserLeave => ProtocolMessage::UserLeave(serde_json::from_value(payload)?),
            MessageType::Operation => ProtocolMessage::Operation(serde_json::from_value(payload)?),
            MessageType::OperationAck => {
                ProtocolMessage::OperationAck(serde_json::from_value(payload)?)
            }
            MessageType::Cursor => ProtocolMessage::Cursor(serde_json::from_value(payload)?),
        };
        Ok(message)
    }
}

/// Frames generated by the relay itself rather than by a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayControl {
    /// Our own relay connection was registered
    Connected { connection_id: String },
    PeerJoined { connection_id: String, user_count: usize },
    PeerLeft { connection_id: String, user_count: usize },
    Error { message: String },
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Relay(RelayControl),
    Message {
        message: ProtocolMessage,
        /// Relay-level sender id from the envelope
        peer_id: Option<String>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    data: Value,
    peer_id: &'a str,
    timestamp: i64,
}

/// Protocol codec for encoding/decoding frames
pub struct SyncProtocol;

impl SyncProtocol {
    /// Wrap a message in the relay envelope and encode it as JSON text
    pub fn encode(message: &ProtocolMessage, peer_id: &str) -> Result<String, ProtocolError> {
        let envelope = Envelope {
            msg_type: message.message_type().as_str(),
            data: message.payload()?,
            peer_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let text = serde_json::to_string(&envelope)?;

        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        Ok(text)
    }

    /// Decode a text frame. When the envelope has no `data`, the whole frame
    /// is taken as the payload.
    pub fn decode(text: &str) -> Result<InboundFrame, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }

        let mut frame: Value = serde_json::from_str(text)?;
        if !frame.is_object() {
            return Err(ProtocolError::InvalidFormat("frame is not a JSON object".to_string()));
        }

        let msg_type = frame
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if let Some(control) = Self::decode_control(&msg_type, &frame) {
            return Ok(InboundFrame::Relay(control));
        }

        let msg_type = MessageType::try_from(msg_type.as_str())?;
        let peer_id = frame
            .get("peerId")
            .and_then(Value::as_str)
            .map(str::to_string);

        let data = frame.get_mut("data").map(Value::take);
        let payload = match data {
            Some(data) if !data.is_null() => data,
            _ => frame,
        };

        Ok(InboundFrame::Message {
            message: ProtocolMessage::from_payload(msg_type, payload)?,
            peer_id,
        })
    }

    fn decode_control(msg_type: &str, frame: &Value) -> Option<RelayControl> {
        let field = |name: &str| {
            frame
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let count = || {
            frame
                .get("userCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize
        };

        match msg_type {
            "connected" => Some(RelayControl::Connected {
                connection_id: field("connectionId"),
            }),
            "user-joined" => Some(RelayControl::PeerJoined {
                connection_id: field("connectionId"),
                user_count: count(),
            }),
            "user-left" => Some(RelayControl::PeerLeft {
                connection_id: field("connectionId"),
                user_count: count(),
            }),
            "error" => Some(RelayControl::Error {
                message: field("message"),
            }),
            _ => None,
        }
    }
}
