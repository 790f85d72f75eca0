//! RTP, ICE and DTLS parameter types exchanged during negotiation
//!
//! The core never interprets RTP parameters beyond codec matching; they are
//! carried between the local media engine and the server untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Wire-level kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Codec-specific parameters (`apt`, `profile-level-id`, ...)
pub type CodecParameters = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: CodecParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
}

impl RtpCodecCapability {
    pub fn new(kind: MediaKind, mime_type: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            kind,
            mime_type: mime_type.into(),
            clock_rate,
            channels: None,
            parameters: CodecParameters::new(),
            preferred_payload_type: None,
        }
    }

    #[must_use]
    pub const fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    #[must_use]
    pub const fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.preferred_payload_type = Some(payload_type);
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Retransmission codecs only make sense next to the codec they repair
    #[must_use]
    pub fn is_rtx(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case("video/rtx")
    }

    /// Payload type this RTX codec repairs (`apt` parameter)
    #[must_use]
    pub fn associated_payload_type(&self) -> Option<u8> {
        match self.parameters.get("apt")? {
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn effective_channels(&self) -> Option<u8> {
        match self.kind {
            MediaKind::Audio => Some(self.channels.unwrap_or(1)),
            MediaKind::Video => None,
        }
    }

    /// Whether both sides describe the same codec
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && self.effective_channels() == other.effective_channels()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    pub kind: MediaKind,
    pub uri: String,
    pub preferred_id: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

impl RtpCapabilities {
    /// Whether any media (non-RTX) codec of `kind` is listed
    #[must_use]
    pub fn supports(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|c| c.kind == kind && !c.is_rtx())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: CodecParameters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_channels_default_to_mono() {
        let router = RtpCodecCapability::new(MediaKind::Audio, "audio/opus", 48000).with_channels(2);
        let local_stereo = RtpCodecCapability::new(MediaKind::Audio, "AUDIO/OPUS", 48000).with_channels(2);
        let local_mono = RtpCodecCapability::new(MediaKind::Audio, "audio/opus", 48000);

        assert!(router.matches(&local_stereo));
        assert!(!router.matches(&local_mono));
    }

    #[test]
    fn test_rtx_associated_payload_type() {
        let numeric = RtpCodecCapability::new(MediaKind::Video, "video/rtx", 90000).with_parameter("apt", 96);
        let textual = RtpCodecCapability::new(MediaKind::Video, "video/rtx", 90000).with_parameter("apt", "101");

        assert!(numeric.is_rtx());
        assert_eq!(numeric.associated_payload_type(), Some(96));
        assert_eq!(textual.associated_payload_type(), Some(101));
    }

    #[test]
    fn test_ice_candidate_wire_names() {
        let candidate = IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1_076_302_079,
            ip: "127.0.0.1".to_string(),
            port: 40000,
            protocol: "udp".to_string(),
            candidate_type: "host".to_string(),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["type"], "host");
        assert_eq!(json["foundation"], "udpcandidate");
    }
}
