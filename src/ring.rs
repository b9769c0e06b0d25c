//! Log/Metrics Ring (C10): a fixed-size ring of `LogEntry` feeding the SSE
//! log endpoint with history-plus-live semantics.
//!
//! A `std::sync::RwLock` guards the plain `VecDeque` — no async needed since
//! every operation is O(1) and never awaits.

use std::collections::VecDeque;
use std::sync::RwLock;

use crate::events::LogEntry;

pub const DEFAULT_CAPACITY: usize = 1000;

type Subscriber = Box<dyn Fn(&LogEntry) + Send + Sync>;

/// Fixed-size append-only ring over `LogEntry`. Oldest entries are
/// overwritten once `capacity` is reached; `read_all` returns a snapshot in
/// strict insertion order.
pub struct LogRing {
    capacity: usize,
    entries: RwLock<VecDeque<LogEntry>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Append `entry`, evicting the oldest one if at capacity, then notify
    /// every subscriber in registration order.
    pub fn append(&self, entry: LogEntry) {
        {
            let mut entries = self.entries.write().unwrap();
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        for cb in self.subscribers.read().unwrap().iter() {
            cb(&entry);
        }
    }

    /// Snapshot of everything currently retained, oldest first.
    pub fn read_all(&self) -> Vec<LogEntry> {
        self.entries.read().unwrap().iter().cloned().collect()
    }

    /// Register a callback invoked on every subsequent `append`. Does not
    /// replay history; pair with `read_all` for history-plus-live delivery.
    pub fn subscribe(&self, cb: impl Fn(&LogEntry) + Send + Sync + 'static) {
        self.subscribers.write().unwrap().push(Box::new(cb));
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
