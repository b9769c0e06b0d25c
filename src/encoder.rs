//! Encoder Selector (C5): picks the best working encoder per codec/input and
//! validates candidates by probing the external encoder binary.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Codec, EncoderChoice, ValidationRecord};

/// Hardware-native encoder families tried first, in priority order.
/// Tie-breaking among multiple hardware families is an explicit open
/// question in the design notes (§9.i) — this crate's decision is recorded
/// in `DESIGN.md`.
fn candidates(codec: Codec) -> &'static [&'static str] {
    match codec {
        Codec::H264 => &["h264_vaapi", "h264_qsv", "h264_nvenc", "libx264"],
        Codec::H265 => &["hevc_vaapi", "hevc_qsv", "hevc_nvenc", "libx265"],
    }
}

fn software_fallback(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "libx264",
        Codec::H265 => "libx265",
    }
}

fn is_hardware(name: &str) -> bool {
    name.ends_with("_vaapi") || name.ends_with("_qsv") || name.ends_with("_nvenc")
}

/// Host-supplied capability: spawn the external encoder binary to validate
/// whether a given encoder name actually produces output on this host.
#[async_trait]
pub trait EncoderProbe: Send + Sync {
    async fn probe(&self, encoder_name: &str, codec: Codec) -> bool;
}

pub struct EncoderSelector;

impl EncoderSelector {
    /// Select an `EncoderChoice` for `codec`. If `override_name` is set it is
    /// used verbatim (with its family's default settings); otherwise the
    /// highest-priority *working* candidate from `validation` is used,
    /// falling back to the canonical software encoder when none validated.
    pub fn select(
        codec: Codec,
        validation: &ValidationRecord,
        override_name: Option<&str>,
    ) -> EncoderChoice {
        let name = match override_name {
            Some(n) => n.to_string(),
            None => {
                let working = &validation.for_codec(codec).working;
                candidates(codec)
                    .iter()
                    .find(|c| working.iter().any(|w| w == *c))
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| {
                        tracing::warn!(
                            codec = codec.as_str(),
                            "no validated hardware encoder, falling back to software"
                        );
                        software_fallback(codec).to_string()
                    })
            }
        };

        tracing::debug!(
            codec = codec.as_str(),
            encoder = %name,
            hardware = is_hardware(&name),
            "encoder selected"
        );
        family_defaults(&name)
    }

    /// Probe every candidate for `codec` with the external encoder binary and
    /// return a fresh `CodecValidation`-shaped working/failed split, used by
    /// the `validate-encoders` CLI subcommand.
    pub async fn validate(
        codec: Codec,
        probe: &dyn EncoderProbe,
    ) -> (Vec<String>, Vec<String>) {
        let mut working = Vec::new();
        let mut failed = Vec::new();
        for &name in candidates(codec) {
            if probe.probe(name, codec).await {
                working.push(name.to_string());
            } else {
                failed.push(name.to_string());
            }
        }
        (working, failed)
    }
}

fn family_defaults(name: &str) -> EncoderChoice {
    let mut output_params = BTreeMap::new();
    let (preset, global_args, video_filters) = if name.ends_with("_vaapi") {
        output_params.insert("rc_mode".into(), "VBR".into());
        (
            None,
            vec!["-vaapi_device".into(), "/dev/dri/renderD128".into()],
            vec!["format=nv12,hwupload".into()],
        )
    } else if name.ends_with("_qsv") {
        (Some("medium".into()), vec![], vec!["format=nv12,hwupload=extra_hw_frames=64".into()])
    } else if name.ends_with("_nvenc") {
        (Some("p4".into()), vec![], vec![])
    } else {
        // Software encoders (libx264/libx265).
        (Some("veryfast".into()), vec![], vec![])
    };

    EncoderChoice {
        name: name.to_string(),
        preset,
        global_args,
        video_filters,
        output_params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CodecValidation;

    fn validation_with(working: &[&str]) -> ValidationRecord {
        let mut record = ValidationRecord::default();
        record.h264.working = working.iter().map(|s| s.to_string()).collect();
        record
    }

    #[test]
    fn prefers_hardware_when_working() {
        let validation = validation_with(&["libx264", "h264_vaapi"]);
        let choice = EncoderSelector::select(Codec::H264, &validation, None);
        assert_eq!(choice.name, "h264_vaapi");
    }

    #[test]
    fn falls_back_to_software_when_nothing_works() {
        let validation = ValidationRecord::default();
        let choice = EncoderSelector::select(Codec::H264, &validation, None);
        assert_eq!(choice.name, "libx264");
    }

    #[test]
    fn override_bypasses_validation() {
        let validation = ValidationRecord::default();
        let choice = EncoderSelector::select(Codec::H264, &validation, Some("h264_nvenc"));
        assert_eq!(choice.name, "h264_nvenc");
        assert_eq!(choice.preset.as_deref(), Some("p4"));
    }

    #[test]
    fn respects_priority_order_among_hardware_families() {
        let validation = validation_with(&["h264_nvenc", "h264_vaapi"]);
        let choice = EncoderSelector::select(Codec::H264, &validation, None);
        assert_eq!(choice.name, "h264_vaapi");
    }

    struct AlwaysFail;
    #[async_trait]
    impl EncoderProbe for AlwaysFail {
        async fn probe(&self, _name: &str, _codec: Codec) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn validate_reports_all_candidates_failed() {
        let (working, failed) = EncoderSelector::validate(Codec::H264, &AlwaysFail).await;
        assert!(working.is_empty());
        assert_eq!(failed.len(), candidates(Codec::H264).len());
    }

    #[test]
    fn is_hardware_classifies_families() {
        assert!(is_hardware("h264_vaapi"));
        assert!(is_hardware("hevc_nvenc"));
        assert!(!is_hardware("libx264"));
    }

    #[allow(dead_code)]
    fn use_codec_validation(_c: &CodecValidation) {}
}
