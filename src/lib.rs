//! collab-ot - real-time collaborative text editing over a WebSocket relay
//!
//! Peers keep a full copy of a plain-text document and exchange character
//! offset insert/delete operations through a relay. Concurrent edits are
//! reconciled with operational transform so every peer converges on the
//! same text:
//! - [`sync`]: operations, transform rules, sessions and the wire protocol
//! - [`transport`]: the relay connection and an in-process relay for tests

pub mod sync;
pub mod transport;

pub use sync::{
    CollaborationSession, CursorState, SessionConfig, SessionEvent, SyncError, SyncResult,
    TextOperation,
};
pub use transport::{MemoryRelay, RelayTransport, Transport, TransportConfig, TransportEvent};
