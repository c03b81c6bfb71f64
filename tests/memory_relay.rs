//! End-to-end sessions over the in-process relay.

use collab_ot::sync::operation::char_len;
use collab_ot::sync::presence::UserInfo;
use collab_ot::transport::MemoryTransport;
use collab_ot::{CollaborationSession, CursorState, MemoryRelay, SessionConfig, TransportEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::UnboundedReceiver;

struct Peer {
    session: CollaborationSession<MemoryTransport>,
    events: UnboundedReceiver<TransportEvent>,
}

impl Peer {
    fn join(relay: &MemoryRelay, user_id: &str, content: &str) -> Self {
        let (transport, events) = relay.join();
        let identity = UserInfo::new(user_id, user_id, "#000000");
        let mut session =
            CollaborationSession::with_identity(transport, SessionConfig::default(), identity);
        session.start(content).unwrap();
        Self { session, events }
    }

    fn deliver(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.session.handle_transport_event(event);
        }
    }

    fn edit(&mut self, rng: &mut StdRng) {
        let chars: Vec<char> = self.session.content().chars().collect();
        let len = chars.len();
        let slice = |from: usize, to: usize| chars[from..to].iter().collect::<String>();

        let next = if len == 0 || rng.gen_bool(0.6) {
            let at = rng.gen_range(0..=len);
            let typed: String = (0..rng.gen_range(1..4))
                .map(|_| (b'a' + rng.gen_range(0..26u8)) as char)
                .collect();
            format!("{}{}{}", slice(0, at), typed, slice(at, len))
        } else if rng.gen_bool(0.7) {
            let start = rng.gen_range(0..len);
            let end = rng.gen_range(start + 1..=len.min(start + 4));
            format!("{}{}", slice(0, start), slice(end, len))
        } else {
            // Replace a short span
            let start = rng.gen_range(0..len);
            let end = rng.gen_range(start + 1..=len.min(start + 3));
            format!("{}##{}", slice(0, start), slice(end, len))
        };

        let cursor = CursorState::at(char_len(&next) / 2);
        self.session.local_edit(&next, cursor).unwrap();
    }
}

fn settle(relay: &MemoryRelay, peers: &mut [&mut Peer]) {
    loop {
        for peer in peers.iter_mut() {
            peer.deliver();
        }
        if relay.pump() == 0 {
            for peer in peers.iter_mut() {
                peer.deliver();
            }
            if relay.queued() == 0 {
                return;
            }
        }
    }
}

#[test]
fn test_concurrent_inserts_at_same_position_converge() {
    let relay = MemoryRelay::new();
    let mut a = Peer::join(&relay, "user_a", "");
    let mut b = Peer::join(&relay, "user_b", "");
    settle(&relay, &mut [&mut a, &mut b]);

    a.session.local_edit("hello", CursorState::at(5)).unwrap();
    b.session.local_edit("world", CursorState::at(5)).unwrap();
    settle(&relay, &mut [&mut a, &mut b]);

    assert_eq!(a.session.content(), "helloworld");
    assert_eq!(a.session.content(), b.session.content());
    assert!(a.session.pending().is_empty());
    assert!(b.session.pending().is_empty());
}

#[test]
fn test_peers_learn_each_other() {
    let relay = MemoryRelay::new();
    let mut a = Peer::join(&relay, "user_a", "");
    let mut b = Peer::join(&relay, "user_b", "");
    settle(&relay, &mut [&mut a, &mut b]);

    assert!(a.session.roster().user("user_b").is_some());
    assert!(b.session.roster().user("user_a").is_some());
    assert_eq!(a.session.stats().relay_user_count, 2);
}

#[test]
fn test_remote_cursor_is_visible() {
    let relay = MemoryRelay::new();
    let mut a = Peer::join(&relay, "user_a", "some text");
    let mut b = Peer::join(&relay, "user_b", "some text");
    settle(&relay, &mut [&mut a, &mut b]);

    a.session.move_cursor(CursorState::at(2).with_selection(6));
    settle(&relay, &mut [&mut a, &mut b]);

    assert_eq!(
        b.session.remote_cursor("user_a"),
        Some(CursorState::at(2).with_selection(6))
    );
}

#[test]
fn test_disconnect_removes_peer() {
    let relay = MemoryRelay::new();
    let mut a = Peer::join(&relay, "user_a", "");
    let mut b = Peer::join(&relay, "user_b", "");
    settle(&relay, &mut [&mut a, &mut b]);

    b.session.disconnect("closing tab");
    settle(&relay, &mut [&mut a]);

    assert!(a.session.roster().user("user_b").is_none());
    assert_eq!(relay.peer_count(), 1);
}

#[test]
fn test_random_concurrent_sessions_converge() {
    for seed in 0..40u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let relay = MemoryRelay::new();
        let start = "The quick brown fox jumps over the lazy dog";
        let mut a = Peer::join(&relay, "user_a", start);
        let mut b = Peer::join(&relay, "user_b", start);
        settle(&relay, &mut [&mut a, &mut b]);

        for _ in 0..30 {
            for _ in 0..rng.gen_range(0..3) {
                a.edit(&mut rng);
            }
            for _ in 0..rng.gen_range(0..3) {
                b.edit(&mut rng);
            }
            settle(&relay, &mut [&mut a, &mut b]);

            assert_eq!(
                a.session.content(),
                b.session.content(),
                "seed {} diverged",
                seed
            );
        }

        assert!(a.session.pending().is_empty());
        assert!(b.session.pending().is_empty());
        assert_eq!(
            a.session.authorship().ranges(),
            b.session.authorship().ranges(),
            "seed {} attribution differs",
            seed
        );
    }
}
