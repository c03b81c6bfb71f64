//! In-process sequencing relay.
//!
//! Peers submit messages with [`Transport::send`]; nothing moves until
//! [`MemoryRelay::pump`] runs a delivery round. A round forwards everything
//! submitted since the previous round to every other open peer, in
//! submission order, and only then acks each operation to its author. Acks
//! therefore always trail the operations that were concurrent with them.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Transport, TransportEvent};
use crate::sync::protocol::{OperationAck, ProtocolMessage, RelayControl};

struct Peer {
    connection_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    open: bool,
}

#[derive(Default)]
struct RelayState {
    peers: Vec<Peer>,
    submitted: Vec<(usize, ProtocolMessage)>,
}

impl RelayState {
    fn open_count(&self) -> usize {
        self.peers.iter().filter(|p| p.open).count()
    }

    fn broadcast_except(&self, from: usize, event: &TransportEvent) {
        for (index, peer) in self.peers.iter().enumerate() {
            if index != from && peer.open {
                let _ = peer.events.send(event.clone());
            }
        }
    }
}

/// Shared relay; clone it to hand out to more peers
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new peer. It immediately receives `Connected` and its relay
    /// connection id; the others are told a peer joined.
    pub fn join(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        let index = state.peers.len();
        let connection_id = format!("mem-{}", index + 1);
        let _ = tx.send(TransportEvent::Connected);
        let _ = tx.send(TransportEvent::Relay(RelayControl::Connected {
            connection_id: connection_id.clone(),
        }));

        state.peers.push(Peer {
            connection_id: connection_id.clone(),
            events: tx,
            open: true,
        });

        let joined = TransportEvent::Relay(RelayControl::PeerJoined {
            connection_id,
            user_count: state.open_count(),
        });
        state.broadcast_except(index, &joined);

        let transport = MemoryTransport {
            state: self.state.clone(),
            index,
        };
        (transport, rx)
    }

    /// Run one delivery round. Returns how many messages were forwarded.
    pub fn pump(&self) -> usize {
        let mut state = self.state.lock();
        let round = std::mem::take(&mut state.submitted);

        for (from, message) in &round {
            let event = TransportEvent::Message {
                message: message.clone(),
                peer_id: Some(state.peers[*from].connection_id.clone()),
            };
            state.broadcast_except(*from, &event);
        }

        for (from, message) in &round {
            if let ProtocolMessage::Operation(op) = message {
                let author = &state.peers[*from];
                if author.open {
                    let ack = ProtocolMessage::OperationAck(OperationAck {
                        operation_id: op.operation_id,
                    });
                    let _ = author.events.send(TransportEvent::Message {
                        message: ack,
                        peer_id: None,
                    });
                }
            }
        }

        debug!("Memory relay delivered {} messages", round.len());
        round.len()
    }

    /// Messages waiting for the next round
    pub fn queued(&self) -> usize {
        self.state.lock().submitted.len()
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().open_count()
    }
}

/// One peer's connection to a [`MemoryRelay`]
pub struct MemoryTransport {
    state: Arc<Mutex<RelayState>>,
    index: usize,
}

impl MemoryTransport {
    pub fn connection_id(&self) -> String {
        self.state.lock().peers[self.index].connection_id.clone()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: ProtocolMessage) {
        let mut state = self.state.lock();
        if state.peers[self.index].open {
            state.submitted.push((self.index, message));
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if !state.peers[self.index].open {
            return;
        }
        state.peers[self.index].open = false;

        let left = TransportEvent::Relay(RelayControl::PeerLeft {
            connection_id: state.peers[self.index].connection_id.clone(),
            user_count: state.open_count(),
        });
        state.broadcast_except(self.index, &left);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::{UserLeave, WireOperation};
    use crate::sync::TextOperation;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_join_announces_peers() {
        let relay = MemoryRelay::new();
        let (_a, mut a_rx) = relay.join();
        let (b, _b_rx) = relay.join();

        let events = drain(&mut a_rx);
        assert_eq!(events[0], TransportEvent::Connected);
        assert_eq!(
            events[2],
            TransportEvent::Relay(RelayControl::PeerJoined {
                connection_id: "mem-2".to_string(),
                user_count: 2
            })
        );
        assert_eq!(b.connection_id(), "mem-2");
        assert_eq!(relay.peer_count(), 2);
    }

    #[test]
    fn test_round_delivers_then_acks() {
        let relay = MemoryRelay::new();
        let (a, mut a_rx) = relay.join();
        let (b, mut b_rx) = relay.join();
        drain(&mut a_rx);
        drain(&mut b_rx);

        let op = TextOperation::insert(0, "x").with_author("alice", 1);
        a.send(ProtocolMessage::operation(&op));
        b.send(ProtocolMessage::UserLeave(UserLeave {
            user_id: "bob".to_string(),
        }));
        assert_eq!(relay.queued(), 2);
        assert_eq!(relay.pump(), 2);

        let to_a = drain(&mut a_rx);
        assert!(matches!(
            &to_a[0],
            TransportEvent::Message { message: ProtocolMessage::UserLeave(_), .. }
        ));
        assert_eq!(
            to_a[1],
            TransportEvent::Message {
                message: ProtocolMessage::OperationAck(OperationAck { operation_id: 1 }),
                peer_id: None
            }
        );

        let to_b = drain(&mut b_rx);
        assert_eq!(to_b.len(), 1);
        assert_eq!(
            to_b[0],
            TransportEvent::Message {
                message: ProtocolMessage::Operation(WireOperation::from(&op)),
                peer_id: Some("mem-1".to_string())
            }
        );
    }

    #[test]
    fn test_closed_peer_is_skipped() {
        let relay = MemoryRelay::new();
        let (a, mut a_rx) = relay.join();
        let (b, mut b_rx) = relay.join();
        drain(&mut a_rx);
        drain(&mut b_rx);

        b.close();
        assert_eq!(relay.peer_count(), 1);
        assert!(matches!(
            drain(&mut a_rx).as_slice(),
            [TransportEvent::Relay(RelayControl::PeerLeft { user_count: 1, .. })]
        ));

        a.send(ProtocolMessage::operation(&TextOperation::insert(0, "y")));
        b.send(ProtocolMessage::operation(&TextOperation::insert(0, "z")));
        assert_eq!(relay.pump(), 1);
        assert!(drain(&mut b_rx).is_empty());
    }
}
