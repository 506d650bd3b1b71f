//! SFU Configuration

use crate::engine::{RtpCodecCapability, WebRtcTransportOptions, WorkerSettings};
use serde::{Deserialize, Serialize};

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Number of engine workers (None = one per CPU core)
    pub num_workers: Option<usize>,
    /// Settings applied to every worker
    pub worker: WorkerSettings,
    /// Codecs offered by every router
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Parameters used for every WebRTC transport
    pub webrtc_transport: WebRtcTransportOptions,
    /// Maximum participants per room (0 = unlimited)
    pub max_participants_per_room: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            num_workers: None,
            worker: WorkerSettings::default(),
            media_codecs: default_media_codecs(),
            webrtc_transport: WebRtcTransportOptions::default(),
            max_participants_per_room: 0,
        }
    }
}

impl SfuConfig {
    /// Worker pool size after applying engine limits
    #[must_use]
    pub fn worker_count(&self, multi_worker: bool) -> usize {
        if !multi_worker {
            return 1;
        }
        self.num_workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.num_workers == Some(0) {
            errors.push("sfu.num_workers must be at least 1".to_string());
        }
        if self.worker.rtc_min_port > self.worker.rtc_max_port {
            errors.push(format!(
                "sfu.worker.rtc_min_port ({}) exceeds rtc_max_port ({})",
                self.worker.rtc_min_port, self.worker.rtc_max_port
            ));
        }
        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must not be empty".to_string());
        }
        if self.webrtc_transport.listen_ips.is_empty() {
            errors.push("sfu.webrtc_transport.listen_ips must not be empty".to_string());
        }
        if !self.webrtc_transport.enable_udp && !self.webrtc_transport.enable_tcp {
            errors.push("sfu.webrtc_transport must enable UDP or TCP".to_string());
        }
        if self.webrtc_transport.enable_sctp
            && (self.webrtc_transport.num_sctp_streams.os == 0
                || self.webrtc_transport.num_sctp_streams.mis == 0)
        {
            errors.push("sfu.webrtc_transport.num_sctp_streams must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Router codecs: Opus for audio, VP8/VP9/H264 for video
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::audio("audio/opus", 48000, 2),
        RtpCodecCapability::video("video/VP8", 90000).with_parameter("x-google-start-bitrate", 1000),
        RtpCodecCapability::video("video/VP9", 90000)
            .with_parameter("profile-id", 2)
            .with_parameter("x-google-start-bitrate", 1000),
        RtpCodecCapability::video("video/h264", 90000)
            .with_parameter("packetization-mode", 1)
            .with_parameter("profile-level-id", "4d0032")
            .with_parameter("level-asymmetry-allowed", 1)
            .with_parameter("x-google-start-bitrate", 1000),
        RtpCodecCapability::video("video/h264", 90000)
            .with_parameter("packetization-mode", 1)
            .with_parameter("profile-level-id", "42e01f")
            .with_parameter("level-asymmetry-allowed", 1)
            .with_parameter("x-google-start-bitrate", 1000),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SfuConfig::default().validate().is_ok());
    }

    #[test]
    fn test_worker_count() {
        let config = SfuConfig {
            num_workers: Some(3),
            ..SfuConfig::default()
        };
        assert_eq!(config.worker_count(true), 3);
        assert_eq!(config.worker_count(false), 1);
        assert!(SfuConfig::default().worker_count(true) >= 1);
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = SfuConfig::default();
        config.num_workers = Some(0);
        config.media_codecs.clear();
        config.worker.rtc_min_port = 50000;
        config.worker.rtc_max_port = 40000;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
