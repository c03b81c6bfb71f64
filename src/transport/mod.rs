//! Message transport between a session and the relay.
//!
//! The session only ever talks to a [`Transport`]: sends are fire-and-forget
//! and never fail from its point of view. Everything coming back
//! (connection changes, peer messages, relay control frames) is delivered as
//! [`TransportEvent`]s which the host feeds into the session.

pub mod memory;
pub mod websocket;

pub use memory::{MemoryRelay, MemoryTransport};
pub use websocket::RelayTransport;

use std::collections::VecDeque;
use std::time::Duration;

use base64::Engine;
use tracing::warn;

use crate::sync::protocol::{ProtocolMessage, RelayControl};

/// Outbound side of a relay connection
pub trait Transport: Send + Sync {
    /// Deliver a message to the room, queueing it while offline
    fn send(&self, message: ProtocolMessage);

    /// Close the connection for good and drop anything still queued
    fn close(&self);
}

/// Events produced by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection (re)established, offline queue flushed
    Connected,
    /// A message from another peer
    Message {
        message: ProtocolMessage,
        peer_id: Option<String>,
    },
    /// The relay's own bookkeeping
    Relay(RelayControl),
    /// Connection lost; the transport may be reconnecting
    Disconnected { reason: String },
    /// Every reconnect attempt failed, the transport has stopped
    ConnectionFailed { attempts: u32 },
}

/// Connection lifecycle as observed from outside the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Gave up after exhausting reconnect attempts
    Failed,
    /// Closed by the local side
    Closed,
}

/// Transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

}

/// Configuration for a relay connection
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base relay URL, e.g. `wss://relay.example.com`
    pub relay_url: String,
    /// Room identifier appended to the relay URL
    pub room_id: String,
    /// Sender id stamped on every envelope
    pub peer_id: String,
    /// Failed connection rounds before giving up
    pub max_reconnect_attempts: u32,
    /// Delay after the n-th failed round is `backoff_base * n`
    pub backoff_base: Duration,
    /// Wait before reconnecting after an abnormal close
    pub reconnect_delay: Duration,
    /// Limit for a single connection attempt
    pub connect_timeout: Duration,
    /// Frames kept while offline
    pub max_queued_messages: usize,
}

impl TransportConfig {
    pub fn new(relay_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            room_id: room_id.into(),
            peer_id: uuid::Uuid::new_v4().to_string(),
            max_reconnect_attempts: 5,
            backoff_base: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            max_queued_messages: 10_000,
        }
    }

    /// Load from `COLLAB_RELAY_URL`, `COLLAB_ROOM` and `COLLAB_ROOM_PASSWORD`
    pub fn from_env() -> Result<Self, TransportError> {
        let relay_url = std::env::var("COLLAB_RELAY_URL")
            .map_err(|_| TransportError::MissingConfig("COLLAB_RELAY_URL".to_string()))?;
        let room = std::env::var("COLLAB_ROOM")
            .map_err(|_| TransportError::MissingConfig("COLLAB_ROOM".to_string()))?;
        let password = std::env::var("COLLAB_ROOM_PASSWORD").unwrap_or_default();

        let config = Self::new(relay_url, room_id_from(&room, &password));
        config.validate()?;
        Ok(config)
    }

    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = peer_id.into();
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, reconnect_delay: Duration) -> Self {
        self.backoff_base = base;
        self.reconnect_delay = reconnect_delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(TransportError::InvalidConfig(format!(
                "relay URL must use ws:// or wss://, got {}",
                self.relay_url
            )));
        }
        if self.room_id.is_empty() {
            return Err(TransportError::InvalidConfig("Room id is empty".to_string()));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(TransportError::InvalidConfig(
                "max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// URLs tried in order during each connection round
    pub fn candidate_urls(&self) -> Vec<String> {
        let base = self.relay_url.trim_end_matches('/');
        vec![
            format!("{}/room/{}", base, self.room_id),
            format!("{}/?room={}", base, self.room_id),
        ]
    }
}

/// Room id shared by everyone who knows the room number and password
pub fn room_id_from(number: &str, password: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", number, password))
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(20)
        .collect()
}

/// Link fragment that lets another browser join the same room
pub fn share_link(base_url: &str, number: &str, password: &str) -> String {
    format!("{}#room={}&pass={}", base_url, number, password)
}

/// Encoded frames waiting for a connection, replayed in FIFO order
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<String>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a frame. Returns false (and drops it) when the queue is full.
    pub fn enqueue(&mut self, frame: String) -> bool {
        if self.queue.len() >= self.max_size {
            warn!("Offline queue full ({} frames), dropping message", self.max_size);
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    /// Oldest frame, left in place until it has been sent
    pub fn front(&self) -> Option<&String> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
