//! Connection events: a broadcast channel the embedding application can
//! subscribe to, rather than an `async_trait` callback interface — this
//! codebase never reaches for `async_trait`.

use tokio::sync::broadcast;

/// Observable lifecycle events for a session, broadcast to any subscriber.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
        session_id: String,
        resumed: bool,
    },
    Disconnected {
        session_id: String,
        code: u16,
    },
    Message {
        session_id: String,
        message_id: u64,
        bytes: usize,
    },
    Error {
        session_id: Option<String>,
        message: String,
    },
}

/// Holds the sending half of the event broadcast channel. Dropped
/// subscribers simply miss events; a full channel drops the oldest event for
/// the slowest subscriber (standard `tokio::sync::broadcast` semantics) and
/// never blocks or slows down the connection that raised the event.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventHub { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Best-effort publish; no subscribers is not an error.
    pub fn publish(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }
}
