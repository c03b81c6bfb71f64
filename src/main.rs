//! collab-peer - headless collaboration peer
//!
//! Joins a relay room and appends every line read from stdin to the shared
//! document, logging what other peers do. Configured from the environment
//! (or a `.env` file):
//! - `COLLAB_RELAY_URL`, `COLLAB_ROOM`, `COLLAB_ROOM_PASSWORD`
//! - `COLLAB_USER_NAME`, `COLLAB_ACK_TIMEOUT_MS`, `COLLAB_TRACK_AUTHORSHIP`

use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, warn};

use collab_ot::sync::operation::char_len;
use collab_ot::{
    CollaborationSession, CursorState, RelayTransport, SessionConfig, SessionEvent,
    TransportConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_ot=info,collab_peer=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let transport_config = TransportConfig::from_env().context("Invalid relay configuration")?;
    let session_config = SessionConfig::from_env().context("Invalid session configuration")?;

    info!(
        "Joining room {} via {}",
        transport_config.room_id, transport_config.relay_url
    );

    let (transport, mut transport_events) = RelayTransport::connect(transport_config);
    let mut session = CollaborationSession::new(transport, session_config);
    let mut session_events = session.subscribe();
    session.start(String::new())?;

    info!(
        "Editing as {} ({})",
        session.identity().name,
        session.user_id()
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut expiry = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            event = transport_events.recv() => match event {
                Some(event) => session.handle_transport_event(event),
                None => {
                    info!("Relay transport stopped");
                    break;
                }
            },

            line = stdin.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    let mut next = session.content().to_string();
                    if !next.is_empty() {
                        next.push('\n');
                    }
                    next.push_str(&line);
                    let cursor = CursorState::at(char_len(&next));
                    session.local_edit(&next, cursor)?;
                }
                None => {
                    session.disconnect("stdin closed");
                    break;
                }
            },

            _ = expiry.tick() => {
                session.expire_stale_pending();
            }

            _ = tokio::signal::ctrl_c() => {
                session.disconnect("interrupted");
                break;
            }
        }

        drain_events(&mut session_events);
    }

    drain_events(&mut session_events);
    info!("Final stats: {}", serde_json::to_string(&session.stats())?);
    Ok(())
}

fn drain_events(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        match events.try_recv() {
            Ok(event) => log_event(&event),
            Err(TryRecvError::Lagged(skipped)) => warn!("Missed {} session events", skipped),
            Err(_) => return,
        }
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::DocumentChanged { content, author, .. } => {
            info!("{} changed the document ({} characters)", author, char_len(content));
            debug!("Document now:\n{}", content);
        }
        SessionEvent::UserJoined(user) => info!("{} joined", user.name),
        SessionEvent::UserLeft { name, .. } => info!("{} left", name),
        SessionEvent::Connected => info!("Connected to relay"),
        SessionEvent::Disconnected { reason } => info!("Disconnected: {}", reason),
        SessionEvent::ConnectionFailed { attempts } => {
            warn!("Could not reach the relay after {} attempts", attempts)
        }
        SessionEvent::RelayError { message } => warn!("Relay error: {}", message),
        SessionEvent::PendingExpired { operation_ids } => {
            warn!("Operations {:?} were never acknowledged", operation_ids)
        }
        other => debug!("{:?}", other),
    }
}
