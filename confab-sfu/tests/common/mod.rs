//! Shared helpers for the SFU integration tests

#![allow(dead_code)]

use confab_sfu::engine::{
    LocalEngine, RtpCodecParameters, RtpEncodingParameters, RtpParameters,
};
use confab_sfu::{
    Participant, ParticipantId, Room, RoomId, ServerEvent, SfuConfig, SfuServer,
    SignalingChannel, TransportDirection, UserInfo,
};
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub async fn server(workers: usize) -> (Arc<SfuServer>, Arc<LocalEngine>) {
    server_with(SfuConfig {
        num_workers: Some(workers),
        ..SfuConfig::default()
    })
    .await
}

pub async fn server_with(config: SfuConfig) -> (Arc<SfuServer>, Arc<LocalEngine>) {
    let engine = Arc::new(LocalEngine::new());
    let server = SfuServer::init(config, Arc::clone(&engine) as _)
        .await
        .expect("server init");
    (server, engine)
}

/// One simulated client: its participant and everything pushed to it
pub struct Client {
    pub id: ParticipantId,
    pub room: Arc<Room>,
    pub participant: Arc<Participant>,
    pub channel: SignalingChannel,
    pub events: mpsc::Receiver<ServerEvent>,
}

impl Client {
    /// Join `room_id` with split send/recv transports
    pub async fn join(server: &SfuServer, room_id: &str, user: &str) -> Self {
        let room = server
            .get_or_create_room(&RoomId::from(room_id))
            .await
            .expect("room");
        let id = ParticipantId::from(user);
        let (channel, events) = SignalingChannel::pair(id.clone(), 256);

        let mut participant = None;
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            let transport = server
                .create_webrtc_transport(room.id())
                .await
                .expect("transport");
            participant = Some(
                room.add_participant(
                    id.clone(),
                    UserInfo::named(user),
                    channel.clone(),
                    Some(direction),
                    transport,
                )
                .await
                .expect("add participant"),
            );
        }

        Self {
            id,
            room,
            participant: participant.expect("participant"),
            channel,
            events,
        }
    }

    /// Join with only a send transport, so consumer creation fails
    pub async fn join_send_only(server: &SfuServer, room_id: &str, user: &str) -> Self {
        let room = server
            .get_or_create_room(&RoomId::from(room_id))
            .await
            .expect("room");
        let id = ParticipantId::from(user);
        let (channel, events) = SignalingChannel::pair(id.clone(), 256);
        let transport = server
            .create_webrtc_transport(room.id())
            .await
            .expect("transport");
        let participant = room
            .add_participant(
                id.clone(),
                UserInfo::named(user),
                channel.clone(),
                Some(TransportDirection::Send),
                transport,
            )
            .await
            .expect("add participant");

        Self {
            id,
            room,
            participant,
            channel,
            events,
        }
    }

    pub async fn declare_capabilities(&self) -> confab_sfu::FanoutReport {
        self.room
            .set_rtp_capabilities(&self.id, self.room.rtp_capabilities())
            .await
            .expect("set capabilities")
    }

    /// Let listener tasks run, then collect what arrived
    pub async fn drain(&mut self) -> Vec<ServerEvent> {
        settle().await;
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
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

pub fn count<F>(events: &[ServerEvent], predicate: F) -> usize
where
    F: Fn(&ServerEvent) -> bool,
{
    events.iter().filter(|event| predicate(event)).count()
}
