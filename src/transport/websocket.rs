//! WebSocket transport to a room relay.
//!
//! A driver task owns the socket and the offline queue. Handles talk to it
//! over a command channel, so sending never blocks and never fails: while
//! the socket is down frames are queued and flushed in order before any new
//! traffic once it is back.
//!
//! Connection policy: each round tries every candidate URL once. After the
//! n-th failed round the driver waits `backoff_base * n`; after
//! `max_reconnect_attempts` failed rounds it reports `ConnectionFailed` and
//! stops. An abnormal close waits `reconnect_delay` and starts a new round.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{ConnectionState, OfflineQueue, Transport, TransportConfig, TransportEvent};
use crate::sync::protocol::{InboundFrame, ProtocolMessage, SyncProtocol};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Send(ProtocolMessage),
    Close,
}

/// Outcome of one pass over the candidate URLs
enum Round {
    Connected(Box<RelaySocket>),
    Failed,
    /// Closed locally while connecting
    Closed,
}

/// How a live connection ended
enum Exit {
    /// Closed locally, the driver stops
    Closed,
    /// Lost; reconnect unless the relay closed normally
    Lost { reason: String, reconnect: bool },
}

/// Handle to a relay connection. Cheap to clone.
#[derive(Clone)]
pub struct RelayTransport {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<ConnectionState>>,
    peer_id: String,
}

impl RelayTransport {
    /// Spawn the connection driver. Must be called inside a tokio runtime.
    pub fn connect(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let handle = Self {
            commands: command_tx,
            state: state.clone(),
            peer_id: config.peer_id.clone(),
        };

        let driver = Driver {
            queue: OfflineQueue::new(config.max_queued_messages),
            config,
            commands: command_rx,
            events: event_tx,
            state,
        };
        tokio::spawn(driver.run());

        (handle, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

impl Transport for RelayTransport {
    fn send(&self, message: ProtocolMessage) {
        if self.commands.send(Command::Send(message)).is_err() {
            debug!("Relay driver stopped, dropping outbound message");
        }
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

struct Driver {
    config: TransportConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<RwLock<ConnectionState>>,
    queue: OfflineQueue,
}

impl Driver {
    async fn run(mut self) {
        let mut attempts: u32 = 0;

        loop {
            let socket = match self.connect_round().await {
                Round::Connected(socket) => socket,
                Round::Closed => return,
                Round::Failed => {
                    attempts += 1;
                    if attempts >= self.config.max_reconnect_attempts {
                        warn!("Giving up on relay after {} failed attempts", attempts);
                        self.set_state(ConnectionState::Failed);
                        self.emit(TransportEvent::ConnectionFailed { attempts });
                        return;
                    }

                    let delay = self.config.backoff_base * attempts;
                    debug!("Retrying relay connection in {:?} (attempt {})", delay, attempts);
                    self.set_state(ConnectionState::Reconnecting);
                    if self.wait_offline(delay).await {
                        return;
                    }
                    continue;
                }
            };

            attempts = 0;
            match self.serve(*socket).await {
                Exit::Closed => {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                Exit::Lost { reason, reconnect } => {
                    self.emit(TransportEvent::Disconnected {
                        reason: reason.clone(),
                    });
                    if !reconnect {
                        info!("Relay closed the connection: {}", reason);
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }

                    warn!("Relay connection lost ({}), reconnecting", reason);
                    self.set_state(ConnectionState::Reconnecting);
                    if self.wait_offline(self.config.reconnect_delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Try each candidate URL once, queueing outbound messages meanwhile
    async fn connect_round(&mut self) -> Round {
        for url in self.config.candidate_urls() {
            debug!("Connecting to relay at {}", url);
            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(url.as_str()),
            );
            tokio::pin!(attempt);

            let result = loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    command = self.commands.recv() => {
                        if self.queue_offline(command) {
                            return Round::Closed;
                        }
                    }
                }
            };

            match result {
                Ok(Ok((socket, _response))) => {
                    info!("Connected to relay at {}", url);
                    return Round::Connected(Box::new(socket));
                }
                Ok(Err(e)) => warn!("Relay connection to {} failed: {}", url, e),
                Err(_) => warn!("Relay connection to {} timed out", url),
            }
        }
        Round::Failed
    }

    /// Drive a live socket until it closes
    async fn serve(&mut self, socket: RelaySocket) -> Exit {
        let (mut sink, mut stream) = socket.split();

        while let Some(frame) = self.queue.front() {
            if let Err(e) = sink.send(Message::Text(frame.clone())).await {
                return Exit::Lost {
                    reason: format!("flush failed: {}", e),
                    reconnect: true,
                };
            }
            self.queue.pop_front();
        }

        self.set_state(ConnectionState::Connected);
        self.emit(TransportEvent::Connected);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(message)) => {
                        let Some(text) = self.encode(&message) else { continue };
                        if let Err(e) = sink.send(Message::Text(text.clone())).await {
                            self.queue.enqueue(text);
                            return Exit::Lost {
                                reason: format!("send failed: {}", e),
                                reconnect: true,
                            };
                        }
                    }
                    Some(Command::Close) | None => {
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Client disconnect".into(),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        let _ = sink.close().await;
                        self.queue.clear();
                        info!("Relay connection closed");
                        return Exit::Closed;
                    }
                },

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (f.code, f.reason.to_string()))
                            .unwrap_or((CloseCode::Status, String::new()));
                        return Exit::Lost {
                            reason: format!("closed by relay ({}): {}", u16::from(code), reason),
                            reconnect: code != CloseCode::Normal,
                        };
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Ignoring {} byte binary frame", data.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Exit::Lost {
                            reason: e.to_string(),
                            reconnect: true,
                        };
                    }
                    None => {
                        return Exit::Lost {
                            reason: "stream ended".to_string(),
                            reconnect: true,
                        };
                    }
                },
            }
        }
    }

    /// Sleep while queueing outbound messages. Returns true if closed meanwhile.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                command = self.commands.recv() => {
                    if self.queue_offline(command) {
                        return true;
                    }
                }
            }
        }
    }

    /// Handle a command while there is no socket. Returns true on close.
    fn queue_offline(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Send(message)) => {
                if let Some(text) = self.encode(&message) {
                    self.queue.enqueue(text);
                }
                false
            }
            Some(Command::Close) | None => {
                self.queue.clear();
                self.set_state(ConnectionState::Closed);
                info!("Relay transport closed while offline");
                true
            }
        }
    }

    fn encode(&self, message: &ProtocolMessage) -> Option<String> {
        match SyncProtocol::encode(message, &self.config.peer_id) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Failed to encode {} message: {}", message.message_type().as_str(), e);
                None
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match SyncProtocol::decode(text) {
            Ok(InboundFrame::Relay(control)) => self.emit(TransportEvent::Relay(control)),
            Ok(InboundFrame::Message { message, peer_id }) => {
                self.emit(TransportEvent::Message { message, peer_id })
            }
            Err(e) => warn!("Skipping relay frame: {}", e),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}
