//! Event payloads published on the bus (C1) and consumed by C7, C10, C11.

use serde::{Deserialize, Serialize};

use crate::model::{Device, DeviceAction};

/// One entry in the log/metrics ring (C10) and the payload of `Event::Log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub module: String,
    pub message: String,
    pub attributes: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Progress metrics parsed from an encoder's `-progress` key=value stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub fps: Option<f64>,
    pub dropped: Option<u64>,
    pub duplicate: Option<u64>,
    pub speed: Option<f64>,
}

/// The typed union published on the event bus (C1).
///
/// Tagged so subscribers can pattern-match by kind; each variant carries a
/// monotonic ingestion timestamp stamped by `EventBus::publish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    StreamCreated {
        stream_id: String,
        ts: chrono::DateTime<chrono::Utc>,
    },
    StreamUpdated {
        stream_id: String,
        ts: chrono::DateTime<chrono::Utc>,
    },
    StreamDeleted {
        stream_id: String,
        ts: chrono::DateTime<chrono::Utc>,
    },
    StreamStateChanged {
        stream_id: String,
        enabled: bool,
        ts: chrono::DateTime<chrono::Utc>,
    },
    DeviceDiscovery {
        action: DeviceAction,
        device: Device,
        ts: chrono::DateTime<chrono::Utc>,
    },
    CaptureSuccess {
        stream_id: String,
        ts: chrono::DateTime<chrono::Utc>,
    },
    CaptureError {
        stream_id: String,
        reason: String,
        ts: chrono::DateTime<chrono::Utc>,
    },
    StreamMetricsUpdate {
        stream_id: String,
        metrics: StreamMetrics,
        ts: chrono::DateTime<chrono::Utc>,
    },
    Log {
        entry: LogEntry,
    },
    StreamCrashed {
        stream_id: String,
        device_id: Option<String>,
        ts: chrono::DateTime<chrono::Utc>,
    },
}

impl Event {
    /// Stable string tag matching the SSE event-type catalogue in §6.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::StreamCreated { .. } => "stream-created",
            Event::StreamUpdated { .. } => "stream-updated",
            Event::StreamDeleted { .. } => "stream-deleted",
            Event::StreamStateChanged { .. } => "stream-state-changed",
            Event::DeviceDiscovery { .. } => "device-discovery",
            Event::CaptureSuccess { .. } => "capture-success",
            Event::CaptureError { .. } => "capture-error",
            Event::StreamMetricsUpdate { .. } => "stream-metrics",
            Event::Log { .. } => "log-entry",
            Event::StreamCrashed { .. } => "stream-crashed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        let ev = Event::StreamCreated {
            stream_id: "cam1".into(),
            ts: chrono::Utc::now(),
        };
        assert_eq!(ev.kind(), "stream-created");
    }
}
