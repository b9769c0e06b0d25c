//! H.264 Stream Handler (C9): RTP passthrough with SPS/PPS injection ahead
//! of every IDR.
//!
//! SPS/PPS are cached once from `sprop-parameter-sets` and injected only
//! ahead of an IDR missing them (`has_idr && (!has_sps || !has_pps)`),
//! classified per RTP packet rather than by whole-frame Annex B scanning
//! since this handler sits on the wire between producer and consumer rather
//! than at the encoder.

use bytes::Bytes;
use rtp::header::Header;
use rtp::packet::Packet;

use crate::error::{AppError, Result};

const NAL_TYPE_MASK: u8 = 0x1F;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_IDR: u8 = 5;
const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// `profile_idc` extracted from `profile-level-id` (hex, first byte) or, as
/// a fallback, from the SPS's own first payload byte.
pub fn parse_profile_idc_from_fmtp(profile_level_id: &str) -> Option<u8> {
    let bytes = hex_decode(profile_level_id)?;
    bytes.first().copied()
}

/// Parse `profile_idc` out of a raw SPS NAL unit (payload includes the NAL
/// header byte): the byte immediately after it.
pub fn parse_profile_idc_from_sps(sps: &[u8]) -> Option<u8> {
    if sps.len() < 2 || sps[0] & NAL_TYPE_MASK != NAL_SPS {
        return None;
    }
    Some(sps[1])
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Decode `sprop-parameter-sets=<base64-sps>,<base64-pps>` into raw NAL
/// bytes (without start codes, as carried in a single-NAL RTP payload).
pub fn parse_sprop_parameter_sets(sprop: &str) -> (Option<Bytes>, Option<Bytes>) {
    use base64::Engine;
    let mut sps = None;
    let mut pps = None;
    for part in sprop.split(',') {
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(part.trim()) else {
            continue;
        };
        if decoded.is_empty() {
            continue;
        }
        match decoded[0] & NAL_TYPE_MASK {
            NAL_SPS => sps = Some(Bytes::from(decoded)),
            NAL_PPS => pps = Some(Bytes::from(decoded)),
            _ => {}
        }
    }
    (sps, pps)
}

/// Per-stream H.264 passthrough with keyframe parameter-set injection.
/// One instance per producer/consumer pairing that negotiated H.264.
pub struct H264Handler {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    payload_type: u8,
    sent_params: bool,
    warned_missing_params: bool,
}

impl H264Handler {
    /// `sprop` is the consumer's negotiated `sprop-parameter-sets` fmtp
    /// value, if any. Without it, injection is skipped (open question §9.iii).
    pub fn new(sprop: Option<&str>, payload_type: u8) -> Self {
        let (sps, pps) = sprop
            .map(parse_sprop_parameter_sets)
            .unwrap_or((None, None));
        Self {
            sps,
            pps,
            payload_type,
            sent_params: false,
            warned_missing_params: false,
        }
    }

    /// Process one inbound RTP packet, returning the packets to forward (in
    /// order): normally just `packet` itself, or `[sps, pps, packet]` when
    /// injection fires ahead of an IDR.
    pub fn process(&mut self, packet: Packet) -> Result<Vec<Packet>> {
        if packet.payload.is_empty() {
            return Err(AppError::MalformedRtp("empty RTP payload".into()));
        }
        let nal_type = packet.payload[0] & NAL_TYPE_MASK;

        match nal_type {
            NAL_SPS | NAL_PPS => {
                self.sent_params = true;
                Ok(vec![packet])
            }
            NAL_STAP_A => {
                if stap_a_contains_params(&packet.payload) {
                    self.sent_params = true;
                }
                Ok(vec![packet])
            }
            NAL_IDR => Ok(self.maybe_inject(packet)),
            NAL_FU_A => {
                if is_fu_a_start(&packet.payload) && fu_a_nal_type(&packet.payload) == Some(NAL_IDR)
                {
                    Ok(self.maybe_inject(packet))
                } else {
                    Ok(vec![packet])
                }
            }
            _ => Ok(vec![packet]),
        }
    }

    fn maybe_inject(&mut self, packet: Packet) -> Vec<Packet> {
        if self.sent_params {
            self.sent_params = false;
            return vec![packet];
        }
        self.sent_params = false;

        let (Some(sps), Some(pps)) = (self.sps.clone(), self.pps.clone()) else {
            if !self.warned_missing_params {
                self.warned_missing_params = true;
                tracing::warn!("no cached SPS/PPS to inject before IDR, forwarding unchanged");
            }
            return vec![packet];
        };

        let header = |seq_offset: u16| Header {
            version: 2,
            padding: false,
            extension: false,
            marker: false,
            payload_type: self.payload_type,
            sequence_number: packet.header.sequence_number.wrapping_sub(seq_offset),
            timestamp: packet.header.timestamp,
            ssrc: packet.header.ssrc,
            ..Default::default()
        };

        vec![
            Packet {
                header: header(2),
                payload: sps,
            },
            Packet {
                header: header(1),
                payload: pps,
            },
            packet,
        ]
    }
}

fn stap_a_contains_params(payload: &Bytes) -> bool {
    let mut i = 1; // skip the STAP-A header byte itself
    while i + 2 <= payload.len() {
        let size = u16::from_be_bytes([payload[i], payload[i + 1]]) as usize;
        let nal_start = i + 2;
        if nal_start >= payload.len() {
            break;
        }
        let nal_type = payload[nal_start] & NAL_TYPE_MASK;
        if nal_type == NAL_SPS || nal_type == NAL_PPS {
            return true;
        }
        i = nal_start + size;
    }
    false
}

fn is_fu_a_start(payload: &Bytes) -> bool {
    payload.len() >= 2 && payload[1] & 0x80 != 0
}

fn fu_a_nal_type(payload: &Bytes) -> Option<u8> {
    if payload.len() < 2 {
        return None;
    }
    Some(payload[1] & NAL_TYPE_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(nal_payload: Vec<u8>, seq: u16, ts: u32) -> Packet {
        Packet {
            header: Header {
                version: 2,
                sequence_number: seq,
                timestamp: ts,
                ssrc: 42,
                payload_type: 96,
                ..Default::default()
            },
            payload: Bytes::from(nal_payload),
        }
    }

    fn sprop_fixture() -> String {
        use base64::Engine;
        let sps = base64::engine::general_purpose::STANDARD.encode([0x67, 0x42, 0x00, 0x1f]);
        let pps = base64::engine::general_purpose::STANDARD.encode([0x68, 0xce, 0x38, 0x80]);
        format!("{sps},{pps}")
    }

    #[test]
    fn first_idr_is_preceded_by_sps_and_pps() {
        let mut handler = H264Handler::new(Some(&sprop_fixture()), 96);
        let idr = packet(vec![0x65, 0xAA, 0xBB], 10, 1000);
        let out = handler.process(idr).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].payload[0] & NAL_TYPE_MASK, NAL_SPS);
        assert_eq!(out[1].payload[0] & NAL_TYPE_MASK, NAL_PPS);
        assert_eq!(out[2].payload[0] & NAL_TYPE_MASK, NAL_IDR);
        assert_eq!(out[0].header.timestamp, 1000);
        assert_eq!(out[0].header.ssrc, 42);
        assert!(!out[0].header.marker);
    }

    #[test]
    fn second_idr_is_preceded_again() {
        let mut handler = H264Handler::new(Some(&sprop_fixture()), 96);
        let first = handler.process(packet(vec![0x65], 1, 100)).unwrap();
        assert_eq!(first.len(), 3);
        let second = handler.process(packet(vec![0x65], 2, 200)).unwrap();
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn idr_after_stap_a_with_params_is_not_injected() {
        let mut handler = H264Handler::new(Some(&sprop_fixture()), 96);
        let mut stap = vec![24u8];
        let sps_nal = [0x67u8, 0x42, 0x00, 0x1f];
        stap.extend((sps_nal.len() as u16).to_be_bytes());
        stap.extend_from_slice(&sps_nal);
        handler.process(packet(stap, 1, 100)).unwrap();

        let idr_out = handler.process(packet(vec![0x65], 2, 100)).unwrap();
        assert_eq!(idr_out.len(), 1);
    }

    #[test]
    fn fu_a_start_fragment_of_idr_triggers_injection() {
        let mut handler = H264Handler::new(Some(&sprop_fixture()), 96);
        // FU indicator (type 28), FU header: S=1, type=5
        let fu_start = vec![0x7Cu8, 0x85, 0xAA];
        let out = handler.process(packet(fu_start, 1, 100)).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn fu_a_non_start_fragment_does_not_trigger_injection() {
        let mut handler = H264Handler::new(Some(&sprop_fixture()), 96);
        // S=0
        let fu_cont = vec![0x7Cu8, 0x05, 0xAA];
        let out = handler.process(packet(fu_cont, 1, 100)).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn non_nal_of_interest_forwards_unchanged() {
        let mut handler = H264Handler::new(Some(&sprop_fixture()), 96);
        let out = handler.process(packet(vec![0x41, 0xAA], 1, 100)).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn missing_params_forwards_idr_without_injection() {
        let mut handler = H264Handler::new(None, 96);
        let out = handler.process(packet(vec![0x65], 1, 100)).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn empty_payload_is_malformed() {
        let mut handler = H264Handler::new(None, 96);
        assert!(handler.process(packet(vec![], 1, 100)).is_err());
    }

    #[test]
    fn profile_level_id_high() {
        assert_eq!(parse_profile_idc_from_fmtp("640034"), Some(0x64));
    }

    #[test]
    fn profile_level_id_baseline() {
        assert_eq!(parse_profile_idc_from_fmtp("42e01f"), Some(0x42));
    }

    #[test]
    fn profile_idc_falls_back_to_sps_byte() {
        let (sps, _) = parse_sprop_parameter_sets(&sprop_fixture());
        let profile = parse_profile_idc_from_sps(&sps.unwrap()).unwrap();
        assert_eq!(profile, 0x42);
    }
}
