//! Process-wide typed event bus (C1).
//!
//! One bus per daemon instance, tied to the root cancellation token. Publish
//! never blocks; a slow subscriber only ever loses its own events (tokio's
//! broadcast channel reports `Lagged` on overflow, which is exactly the
//! at-most-once-per-subscriber contract this component promises).

pub mod types;

pub use types::{Event, LogEntry, LogLevel, StreamMetrics};

use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Fire-and-forget publish. Returns immediately; if there are no
    /// subscribers the event is simply dropped.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Register a new subscriber. No replay: the subscriber only sees events
    /// published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
