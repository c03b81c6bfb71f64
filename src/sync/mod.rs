//! Operational-transform synchronization for a shared plain-text document.
//!
//! This module implements the peer side of real-time collaboration:
//! - Insert/delete operations addressed by character offset
//! - The transform rules that let concurrent edits converge
//! - A pending buffer for optimistic local echo until the relay acks
//! - Per-character authorship tracking
//! - Presence: identities, colors and cursors
//! - The JSON wire protocol spoken through the relay

pub mod authorship;
pub mod diff;
pub mod operation;
pub mod pending;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transform;

pub use authorship::{AuthorshipRange, AuthorshipTracker};
pub use operation::{OperationKind, TextOperation};
pub use pending::PendingOperationBuffer;
pub use presence::{CursorState, PresenceRoster, UserInfo};
pub use protocol::{ProtocolError, ProtocolMessage};
pub use session::{CollaborationSession, SessionEvent, SessionStats};
pub use transform::{transform, Transformed};

use std::time::Duration;

/// Unique identifier for a peer
pub type UserId = String;

/// Per-peer monotonic operation sequence number
pub type OperationId = u64;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync layer
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The session was disconnected and its state dropped
    #[error("Session is closed")]
    SessionClosed,
}

/// Fresh peer identity: `user_` followed by a random UUID
pub fn generate_user_id() -> UserId {
    format!("user_{}", uuid::Uuid::new_v4().simple())
}

/// Configuration for a collaboration session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Display name announced on join; generated when absent
    pub user_name: Option<String>,
    /// Maintain per-character authorship ranges
    pub track_authorship: bool,
    /// Drop unacknowledged operations older than this. `None` keeps them
    /// until acked or disconnected.
    pub ack_timeout: Option<Duration>,
    /// Capacity of the session event channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_name: None,
            track_authorship: true,
            ack_timeout: None,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Read `COLLAB_USER_NAME`, `COLLAB_ACK_TIMEOUT_MS` and
    /// `COLLAB_TRACK_AUTHORSHIP`, falling back to defaults for unset values
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("COLLAB_USER_NAME") {
            if !name.trim().is_empty() {
                config.user_name = Some(name.trim().to_string());
            }
        }

        if let Ok(raw) = std::env::var("COLLAB_ACK_TIMEOUT_MS") {
            let millis: u64 = raw.trim().parse().map_err(|_| {
                SyncError::Config(format!("COLLAB_ACK_TIMEOUT_MS is not a number: {}", raw))
            })?;
            config.ack_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }

        if let Ok(raw) = std::env::var("COLLAB_TRACK_AUTHORSHIP") {
            config.track_authorship = parse_flag(&raw).ok_or_else(|| {
                SyncError::Config(format!("COLLAB_TRACK_AUTHORSHIP is not a boolean: {}", raw))
            })?;
        }

        Ok(config)
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn with_authorship(mut self, enabled: bool) -> Self {
        self.track_authorship = enabled;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
