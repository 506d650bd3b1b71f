//! RTP, ICE, DTLS and SCTP parameter types exchanged with clients
//!
//! JSON field names are camelCase so the structures can be relayed verbatim
//! to browser-side SFU client libraries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Media type understood by the engine (screen shares are plain audio/video here)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// RTCP feedback mechanism supported by a codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameter: String,
}

impl RtcpFeedback {
    pub fn new(kind: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameter: parameter.into(),
        }
    }
}

/// A codec an endpoint (or the router) is able to send or receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaType,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    pub fn audio(mime_type: impl Into<String>, clock_rate: u32, channels: u8) -> Self {
        Self {
            kind: MediaType::Audio,
            mime_type: mime_type.into(),
            preferred_payload_type: None,
            clock_rate,
            channels: Some(channels),
            parameters: Map::new(),
            rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
        }
    }

    pub fn video(mime_type: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            kind: MediaType::Video,
            mime_type: mime_type.into(),
            preferred_payload_type: None,
            clock_rate,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: vec![
                RtcpFeedback::new("nack", ""),
                RtcpFeedback::new("nack", "pli"),
                RtcpFeedback::new("ccm", "fir"),
                RtcpFeedback::new("goog-remb", ""),
                RtcpFeedback::new("transport-cc", ""),
            ],
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Whether an encoded stream described by `codec` can be decoded by this capability.
    ///
    /// Mime type (case-insensitive), clock rate and channel count must agree.
    /// H264 additionally requires the same packetization mode.
    #[must_use]
    pub fn matches(&self, codec: &RtpCodecParameters) -> bool {
        if !self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            || self.clock_rate != codec.clock_rate
        {
            return false;
        }

        if self.kind == MediaType::Audio && self.channels.unwrap_or(1) != codec.channels.unwrap_or(1) {
            return false;
        }

        if self.mime_type.eq_ignore_ascii_case("video/h264") {
            let mode = |params: &Map<String, Value>| {
                params
                    .get("packetization-mode")
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
            };
            if mode(&self.parameters) != mode(&codec.parameters) {
                return false;
            }
        }

        true
    }
}

/// Header extension supported by the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    pub kind: MediaType,
    pub uri: String,
    pub preferred_id: u8,
}

/// Full capability set of an endpoint or router
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

impl RtpCapabilities {
    /// Find the first capability able to decode `codec`
    #[must_use]
    pub fn find_match(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|cap| cap.matches(codec))
    }
}

/// A negotiated codec inside concrete RTP parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u8,
    #[serde(default)]
    pub encrypt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtx: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default = "default_true")]
    pub reduced_size: bool,
}

const fn default_true() -> bool {
    true
}

/// Concrete parameters of a sent or received RTP stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub address: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpParameters {
    pub port: u16,
    #[serde(rename = "OS")]
    pub os: u16,
    #[serde(rename = "MIS")]
    pub mis: u16,
    pub max_message_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(mime: &str, clock_rate: u32, channels: Option<u8>) -> RtpCodecParameters {
        RtpCodecParameters {
            mime_type: mime.to_string(),
            payload_type: 100,
            clock_rate,
            channels,
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        }
    }

    #[test]
    fn test_codec_match_is_case_insensitive() {
        let cap = RtpCodecCapability::video("video/VP8", 90000);
        assert!(cap.matches(&codec("video/vp8", 90000, None)));
        assert!(!cap.matches(&codec("video/VP9", 90000, None)));
        assert!(!cap.matches(&codec("video/VP8", 48000, None)));
    }

    #[test]
    fn test_audio_channels_must_agree() {
        let cap = RtpCodecCapability::audio("audio/opus", 48000, 2);
        assert!(cap.matches(&codec("audio/opus", 48000, Some(2))));
        assert!(!cap.matches(&codec("audio/opus", 48000, Some(1))));
    }

    #[test]
    fn test_h264_packetization_mode() {
        let cap = RtpCodecCapability::video("video/H264", 90000)
            .with_parameter("packetization-mode", 1);
        let mut stream = codec("video/H264", 90000, None);
        assert!(!cap.matches(&stream));
        stream
            .parameters
            .insert("packetization-mode".to_string(), Value::from(1));
        assert!(cap.matches(&stream));
    }

    #[test]
    fn test_capabilities_json_is_camel_case() {
        let caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability::audio("audio/opus", 48000, 2)],
            header_extensions: Vec::new(),
        };
        let json = serde_json::to_value(&caps).unwrap();
        assert_eq!(json["codecs"][0]["mimeType"], "audio/opus");
        assert_eq!(json["codecs"][0]["clockRate"], 48000);
        assert!(json.get("headerExtensions").is_some());
    }
}
