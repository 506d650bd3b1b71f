//! Unit test fixtures backed by the in-process engine

use crate::config::default_media_codecs;
use crate::engine::{
    EngineRouter, EngineTransport, EngineWorker, LocalEngine, MediaEngine, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters, WebRtcTransportOptions, WorkerSettings,
};
use serde_json::Map;
use std::sync::Arc;

pub struct Fixture {
    pub worker: Arc<dyn EngineWorker>,
    pub router: Arc<dyn EngineRouter>,
}

impl Fixture {
    pub async fn new() -> Self {
        let worker = LocalEngine::new()
            .create_worker(&WorkerSettings::default())
            .await
            .unwrap();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        Self { worker, router }
    }

    pub async fn transport(&self) -> Arc<dyn EngineTransport> {
        self.router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap()
    }
}

fn parameters(mime_type: &str, payload_type: u8, clock_rate: u32, channels: Option<u8>) -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: mime_type.to_string(),
            payload_type,
            clock_rate,
            channels,
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(rand::random()),
            ..RtpEncodingParameters::default()
        }],
        ..RtpParameters::default()
    }
}

pub fn vp8_parameters() -> RtpParameters {
    parameters("video/VP8", 96, 90000, None)
}

pub fn opus_parameters() -> RtpParameters {
    parameters("audio/opus", 111, 48000, Some(2))
}
