//! Shared data model (§3): the records components exchange by value or by id.
//!
//! Ownership is strict: the Stream Store owns `StreamSpec`, the Process
//! Supervisor owns `Stream`, the Device Registry owns `Device`. Nothing here
//! holds a pointer into another component's records — everything downstream
//! refers back by `id`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Codec a stream encodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
        }
    }
}

/// Behavior flags ordered the same way the command synthesizer emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FfmpegOption {
    LowLatency,
    Deinterlace,
    Denoise,
    HardwareUpload,
}

/// Rate-control mode and target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quality {
    pub mode: QualityMode,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMode {
    Cbr,
    Vbr,
    Cqp,
}

/// The `ffmpeg` sub-record of a `StreamSpec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegSpec {
    pub codec: Codec,
    pub input_format: String,
    /// `WxH`, or empty to let the device's native resolution pass through.
    #[serde(default)]
    pub resolution: String,
    pub fps: u32,
    #[serde(default)]
    pub audio_device: Option<String>,
    #[serde(default)]
    pub options: Vec<FfmpegOption>,
    pub quality: Quality,
}

/// A persistent stream specification, as stored by C2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSpec {
    pub id: String,
    pub name: String,
    pub device: String,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub custom_command: Option<Vec<String>>,
    pub ffmpeg: FfmpegSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SpecValidationError {
    #[error("id {0:?} does not match ^[A-Za-z0-9_-]{{1,50}}$")]
    InvalidId(String),
    #[error("resolution {0:?} does not match ^\\d+x\\d+$")]
    InvalidResolution(String),
}

impl StreamSpec {
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        let id_ok = !self.id.is_empty()
            && self.id.len() <= 50
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !id_ok {
            return Err(SpecValidationError::InvalidId(self.id.clone()));
        }
        if !self.ffmpeg.resolution.is_empty() {
            let valid = self
                .ffmpeg
                .resolution
                .split_once('x')
                .map(|(w, h)| {
                    !w.is_empty()
                        && !h.is_empty()
                        && w.chars().all(|c| c.is_ascii_digit())
                        && h.chars().all(|c| c.is_ascii_digit())
                })
                .unwrap_or(false);
            if !valid {
                return Err(SpecValidationError::InvalidResolution(
                    self.ffmpeg.resolution.clone(),
                ));
            }
        }
        Ok(())
    }
}

/// Runtime stream state, owned exclusively by the Process Supervisor (C7).
#[derive(Debug, Clone)]
pub struct Stream {
    pub id: String,
    pub device_id: String,
    pub codec: Codec,
    pub start_time: DateTime<Utc>,
    pub enabled: bool,
    pub progress_endpoint: std::net::SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Webcam,
    Hdmi,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    Add,
    Remove,
    Change,
    StatusChanged,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub formats: Vec<String>,
    pub resolutions: Vec<(u32, u32)>,
    pub framerates: Vec<u32>,
}

/// Runtime device record, owned exclusively by the Device Registry (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub kernel_path: String,
    pub kind: DeviceKind,
    pub ready: bool,
    pub caps: DeviceCaps,
    pub last_change_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    NoLink,
    NoSignal,
    Unstable,
    Locked,
    OutOfRange,
    NotSupported,
}

impl SignalState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SignalState::Locked)
    }
}

#[derive(Debug, Clone)]
pub struct FormatInfo {
    pub fourcc: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Framerate {
    pub fps: u32,
}

/// An encoder choice produced transiently by C5, consumed by C6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderChoice {
    pub name: String,
    pub preset: Option<String>,
    pub global_args: Vec<String>,
    pub video_filters: Vec<String>,
    pub output_params: BTreeMap<String, String>,
}

/// Persisted sidecar recording which encoder binaries actually work here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationRecord {
    #[serde(default)]
    pub h264: CodecValidation,
    #[serde(default)]
    pub h265: CodecValidation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodecValidation {
    #[serde(default)]
    pub working: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

impl ValidationRecord {
    pub fn for_codec(&self, codec: Codec) -> &CodecValidation {
        match codec {
            Codec::H264 => &self.h264,
            Codec::H265 => &self.h265,
        }
    }

    pub fn for_codec_mut(&mut self, codec: Codec) -> &mut CodecValidation {
        match codec {
            Codec::H264 => &mut self.h264,
            Codec::H265 => &mut self.h265,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, resolution: &str) -> StreamSpec {
        StreamSpec {
            id: id.into(),
            name: "cam".into(),
            device: "usb-0000:00:14.0-1".into(),
            test_mode: false,
            custom_command: None,
            ffmpeg: FfmpegSpec {
                codec: Codec::H264,
                input_format: "yuyv422".into(),
                resolution: resolution.into(),
                fps: 30,
                audio_device: None,
                options: vec![],
                quality: Quality {
                    mode: QualityMode::Vbr,
                    bitrate_kbps: 4000,
                },
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(spec("cam1", "1920x1080").validate().is_ok());
    }

    #[test]
    fn empty_resolution_is_valid() {
        assert!(spec("cam1", "").validate().is_ok());
    }

    #[test]
    fn rejects_bad_id() {
        assert!(spec("cam 1!", "1920x1080").validate().is_err());
    }

    #[test]
    fn rejects_bad_resolution() {
        assert!(spec("cam1", "1920x").validate().is_err());
        assert!(spec("cam1", "x1080").validate().is_err());
        assert!(spec("cam1", "1920-1080").validate().is_err());
    }
}
