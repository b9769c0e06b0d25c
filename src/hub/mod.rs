//! Media Hub (C8): accepts producer RTP from the encoder and wires it out to
//! consumers (WebRTC, RTSP), matching codec parameters and installing the
//! H.264 passthrough where applicable.
//!
//! Producer/session bookkeeping lives behind a `Mutex<HashMap<...>>` keyed by
//! stream id. The actual RTP transport (accepting an RTSP ANNOUNCE, a WebRTC
//! peer connection) stays behind the `ProducerConnection`/`ConsumerConnection`
//! traits — the same capability-boundary pattern as `DeviceProbe`/
//! `EncoderRunner`, since this crate's scope is the orchestration core, not
//! the transport stack.

pub mod h264;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rtp::packet::Packet;
use tokio::sync::{Mutex, RwLock};

use crate::error::{AppError, Result};
use h264::H264Handler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub kind: MediaKind,
    pub codec: String,
    pub payload_type: u8,
    /// fmtp `sprop-parameter-sets`, when the track is H.264.
    pub sprop_parameter_sets: Option<String>,
    /// fmtp `profile-level-id`, when the track is H.264.
    pub profile_level_id: Option<String>,
}

/// One inbound media connection from the encoder.
#[async_trait]
pub trait ProducerConnection: Send + Sync {
    fn tracks(&self) -> Vec<TrackInfo>;
    async fn recv(&self, kind: MediaKind) -> Option<Packet>;
}

/// One outbound media connection to a client. `media_filter` is `None` for
/// RTSP-style playback (gets every track) or `Some(kinds)` for WebRTC-style
/// sendonly negotiation (gets exactly those kinds).
#[async_trait]
pub trait ConsumerConnection: Send + Sync {
    fn media_filter(&self) -> Option<Vec<MediaKind>>;
    /// The consumer's own negotiated track parameters, used for codec
    /// matching (profile-level-id / sprop-parameter-sets).
    fn negotiated(&self, kind: MediaKind) -> Option<TrackInfo>;
    async fn send(&self, kind: MediaKind, packet: Packet) -> Result<()>;
    async fn notify_producer_replaced(&self);
    async fn notify_producer_ended(&self);
}

type ProducerReplacedCallback = Box<dyn Fn(&str) + Send + Sync>;

struct StreamEntry {
    producer: Arc<dyn ProducerConnection>,
    consumers: Vec<Arc<dyn ConsumerConnection>>,
}

/// Registry of producers keyed by `stream_id`, with per-stream consumer
/// fan-out. One instance per daemon.
pub struct MediaHub {
    streams: RwLock<HashMap<String, StreamEntry>>,
    on_replaced: Mutex<Option<ProducerReplacedCallback>>,
}

impl MediaHub {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            on_replaced: Mutex::new(None),
        }
    }

    pub async fn set_on_producer_replaced(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_replaced.lock().await = Some(Box::new(cb));
    }

    /// Register (or replace) the producer for `stream_id`. Replacing an
    /// existing producer notifies every attached consumer to reconnect.
    pub async fn add_producer(&self, stream_id: &str, producer: Arc<dyn ProducerConnection>) {
        let mut guard = self.streams.write().await;
        let replaced = guard
            .insert(
                stream_id.to_string(),
                StreamEntry {
                    producer,
                    consumers: Vec::new(),
                },
            )
            .is_some();
        drop(guard);

        if replaced {
            if let Some(cb) = self.on_replaced.lock().await.as_ref() {
                cb(stream_id);
            }
            let guard = self.streams.read().await;
            if let Some(entry) = guard.get(stream_id) {
                for consumer in &entry.consumers {
                    consumer.notify_producer_replaced().await;
                }
            }
        }
    }

    /// Remove the producer for `stream_id`, notifying and tearing down every
    /// attached consumer.
    pub async fn remove_producer(&self, stream_id: &str) {
        let removed = self.streams.write().await.remove(stream_id);
        if let Some(entry) = removed {
            for consumer in entry.consumers {
                consumer.notify_producer_ended().await;
            }
        }
    }

    pub async fn get_producer(&self, stream_id: &str) -> Option<Arc<dyn ProducerConnection>> {
        self.streams
            .read()
            .await
            .get(stream_id)
            .map(|e| e.producer.clone())
    }

    pub async fn has_producer(&self, stream_id: &str) -> bool {
        self.streams.read().await.contains_key(stream_id)
    }

    pub async fn list_streams(&self) -> Vec<String> {
        self.streams.read().await.keys().cloned().collect()
    }

    /// Attach `consumer` to `stream_id`'s producer, pumping every matched
    /// track. Returns `StreamNotFound` if no producer is registered yet.
    pub async fn wire_consumer(
        &self,
        stream_id: &str,
        consumer: Arc<dyn ConsumerConnection>,
    ) -> Result<()> {
        let producer = {
            let mut guard = self.streams.write().await;
            let entry = guard
                .get_mut(stream_id)
                .ok_or_else(|| AppError::StreamNotFound(stream_id.to_string()))?;
            entry.consumers.push(consumer.clone());
            entry.producer.clone()
        };

        let wanted = consumer.media_filter();
        for track in producer.tracks() {
            if let Some(kinds) = &wanted {
                if !kinds.contains(&track.kind) {
                    continue;
                }
            }
            spawn_pump(stream_id.to_string(), producer.clone(), consumer.clone(), track);
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let mut guard = self.streams.write().await;
        for (_, entry) in guard.drain() {
            for consumer in entry.consumers {
                consumer.notify_producer_ended().await;
            }
        }
    }
}

impl Default for MediaHub {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_pump(
    stream_id: String,
    producer: Arc<dyn ProducerConnection>,
    consumer: Arc<dyn ConsumerConnection>,
    track: TrackInfo,
) {
    tokio::spawn(async move {
        let mut h264 = if track.codec.eq_ignore_ascii_case("h264") {
            let sprop = consumer
                .negotiated(track.kind)
                .and_then(|t| t.sprop_parameter_sets)
                .or_else(|| track.sprop_parameter_sets.clone());
            Some(H264Handler::new(sprop.as_deref(), track.payload_type))
        } else {
            None
        };

        while let Some(packet) = producer.recv(track.kind).await {
            let outgoing = match &mut h264 {
                Some(handler) => match handler.process(packet) {
                    Ok(packets) => packets,
                    Err(e) => {
                        tracing::warn!(stream_id = %stream_id, error = %e, "dropping malformed RTP packet");
                        continue;
                    }
                },
                None => vec![packet],
            };
            for out in outgoing {
                if consumer.send(track.kind, out).await.is_err() {
                    return;
                }
            }
        }
    });
}

/// Selects the best consumer codec match for an H.264 producer track: prefer
/// an exact `profile-level-id` match, else parse the producer's SPS.
pub fn match_h264_profile(producer: &TrackInfo, consumer_sprop: Option<&str>) -> Option<u8> {
    if let Some(fmtp) = &producer.profile_level_id {
        if let Some(idc) = h264::parse_profile_idc_from_fmtp(fmtp) {
            return Some(idc);
        }
    }
    let sprop = producer.sprop_parameter_sets.as_deref().or(consumer_sprop)?;
    let (sps, _) = h264::parse_sprop_parameter_sets(sprop);
    sps.and_then(|s| h264::parse_profile_idc_from_sps(&s))
}
