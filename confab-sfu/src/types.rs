//! Common types used throughout the SFU implementation

use crate::engine::MediaType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Unique identifier for a participant (the authenticated user id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a conferencing room
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Logical media slot of a participant. A participant has at most one
/// active producer per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaKind {
    Audio,
    Video,
    ScreenVideo,
    ScreenAudio,
}

impl MediaKind {
    pub const ALL: [Self; 4] = [
        Self::Audio,
        Self::Video,
        Self::ScreenVideo,
        Self::ScreenAudio,
    ];

    /// Media type the engine sees for this slot
    #[must_use]
    pub const fn media_type(&self) -> MediaType {
        match self {
            Self::Audio | Self::ScreenAudio => MediaType::Audio,
            Self::Video | Self::ScreenVideo => MediaType::Video,
        }
    }

    #[must_use]
    pub const fn is_screen(&self) -> bool {
        matches!(self, Self::ScreenVideo | Self::ScreenAudio)
    }

    /// Slot a consumer lands in given the engine media type and whether the
    /// source producer is a screen share
    #[must_use]
    pub const fn from_media(media_type: MediaType, screen: bool) -> Self {
        match (media_type, screen) {
            (MediaType::Audio, false) => Self::Audio,
            (MediaType::Video, false) => Self::Video,
            (MediaType::Audio, true) => Self::ScreenAudio,
            (MediaType::Video, true) => Self::ScreenVideo,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::ScreenVideo => "screen-video",
            Self::ScreenAudio => "screen-audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a WebRTC transport, from the client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}

/// Pre-verified identity details forwarded by the authentication boundary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserInfo {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            extra: Map::new(),
        }
    }
}

/// Whether a producer's app data tags it as a screen share
#[must_use]
pub fn is_screen_share(app_data: &Value) -> bool {
    app_data
        .get("share")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || app_data
            .get("source")
            .and_then(Value::as_str)
            .is_some_and(|source| source.starts_with("screen"))
}
