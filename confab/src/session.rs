//! One signaling connection's request handling
//!
//! A [`SignalingSession`] is transport-agnostic: the WebSocket handler feeds
//! it text frames, tests feed it [`ClientRequest`]s directly. Replies and
//! pushed room events both leave through the participant's
//! [`SignalingChannel`].

use confab_sfu::engine::{
    ConsumerId, DtlsParameters, EngineTransport, RtpCapabilities, RtpParameters,
};
use confab_sfu::{
    MediaKind, Participant, ParticipantId, Room, RoomId, ServerEvent, SfuError, SfuServer,
    SignalingChannel, TransportDirection, UserInfo,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Requests a client may send, framed as `{"event": ..., "data": {...}}`
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    JoinRoom {
        room_id: RoomId,
    },
    CreateWebrtcTransport {
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default)]
        direction: Option<TransportDirection>,
    },
    ConnectWebrtcTransport {
        dtls_parameters: DtlsParameters,
        #[serde(default)]
        direction: Option<TransportDirection>,
    },
    SetRtpCapabilities {
        rtp_capabilities: RtpCapabilities,
    },
    CreateProducer {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: Value,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    PauseConsumer {
        consumer_id: ConsumerId,
    },
    PauseProducer {
        kind: MediaKind,
    },
    ResumeProducer {
        kind: MediaKind,
    },
    CloseProducer {
        kind: MediaKind,
    },
    ResumeAllConsumers,
    GetParticipantStats,
    Disconnect,
}

impl ClientRequest {
    const fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::CreateWebrtcTransport { .. } => "create-webrtc-transport",
            Self::ConnectWebrtcTransport { .. } => "connect-webrtc-transport",
            Self::SetRtpCapabilities { .. } => "set-rtp-capabilities",
            Self::CreateProducer { .. } => "create-producer",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::PauseConsumer { .. } => "pause-consumer",
            Self::PauseProducer { .. } => "pause-producer",
            Self::ResumeProducer { .. } => "resume-producer",
            Self::CloseProducer { .. } => "close-producer",
            Self::ResumeAllConsumers => "resume-all-consumers",
            Self::GetParticipantStats => "get-participant-stats",
            Self::Disconnect => "disconnect",
        }
    }
}

pub struct SignalingSession {
    server: Arc<SfuServer>,
    participant_id: ParticipantId,
    user_info: UserInfo,
    channel: SignalingChannel,
    room: Option<Arc<Room>>,
    /// Set once this connection owns a participant in `room`
    attached: bool,
    disconnected: bool,
}

impl SignalingSession {
    #[must_use]
    pub fn new(server: Arc<SfuServer>, user_info: UserInfo, channel: SignalingChannel) -> Self {
        Self {
            server,
            participant_id: channel.participant_id().clone(),
            user_info,
            channel,
            room: None,
            attached: false,
            disconnected: false,
        }
    }

    #[must_use]
    pub const fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    #[must_use]
    pub const fn room(&self) -> Option<&Arc<Room>> {
        self.room.as_ref()
    }

    /// Handle one text frame. Returns false once the connection should close.
    pub async fn handle_text(&mut self, text: &str) -> bool {
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                debug!(participant_id = %self.participant_id, error = %e, "Malformed signaling frame");
                self.channel
                    .send(ServerEvent::error(format!("Invalid message: {e}")));
                !self.disconnected
            }
        }
    }

    /// Handle one request. Failures are reported to this connection only.
    pub async fn handle(&mut self, request: ClientRequest) -> bool {
        if self.disconnected {
            return false;
        }
        if matches!(request, ClientRequest::Disconnect) {
            self.disconnect().await;
            return false;
        }

        let name = request.name();
        if let Err(e) = self.dispatch(request).await {
            warn!(
                participant_id = %self.participant_id,
                request = name,
                kind = ?e.kind(),
                error = %e,
                "Signaling request failed"
            );
            self.channel.send(ServerEvent::error(e.to_string()));
        }
        true
    }

    async fn dispatch(&mut self, request: ClientRequest) -> confab_sfu::Result<()> {
        match request {
            ClientRequest::JoinRoom { room_id } => {
                let room = self.join(&room_id).await?;
                self.channel.send(ServerEvent::RouterRtpCapabilities {
                    rtp_capabilities: room.rtp_capabilities(),
                });
            }
            ClientRequest::CreateWebrtcTransport { room_id, direction } => {
                self.create_transport(room_id, direction).await?;
            }
            ClientRequest::ConnectWebrtcTransport {
                dtls_parameters,
                direction,
            } => {
                let participant = self.participant()?;
                participant
                    .connect_transport(direction, dtls_parameters)
                    .await?;
                self.channel
                    .send(ServerEvent::WebrtcTransportConnected { direction });
            }
            ClientRequest::SetRtpCapabilities { rtp_capabilities } => {
                let room = self.current_room()?;
                let report = room
                    .set_rtp_capabilities(&self.participant_id, rtp_capabilities)
                    .await?;
                debug!(
                    participant_id = %self.participant_id,
                    created = report.created(),
                    skipped = report.skipped(),
                    failed = report.failed(),
                    "Capabilities declared"
                );
            }
            ClientRequest::CreateProducer {
                kind,
                rtp_parameters,
                app_data,
            } => {
                let room = self.current_room()?;
                let (producer, _) = room
                    .produce(&self.participant_id, kind, rtp_parameters, app_data)
                    .await?;
                self.channel.send(ServerEvent::ProducerCreated {
                    producer_id: producer.producer_id,
                    kind: producer.kind,
                    app_data: producer.app_data,
                });
            }
            ClientRequest::ResumeConsumer { consumer_id } => {
                let participant = self.participant()?;
                participant.resume_consumer(consumer_id).await?;
            }
            ClientRequest::PauseConsumer { consumer_id } => {
                let participant = self.participant()?;
                participant.pause_consumer(consumer_id).await?;
            }
            ClientRequest::PauseProducer { kind } => {
                self.current_room()?
                    .pause_producer(&self.participant_id, kind)
                    .await?;
            }
            ClientRequest::ResumeProducer { kind } => {
                self.current_room()?
                    .resume_producer(&self.participant_id, kind)
                    .await?;
            }
            ClientRequest::CloseProducer { kind } => {
                self.current_room()?
                    .close_producer(&self.participant_id, kind)
                    .await?;
            }
            ClientRequest::ResumeAllConsumers => {
                let participant = self.participant()?;
                let results = participant.resume_all_consumers().await;
                let failed = results.iter().filter(|(_, result)| result.is_err()).count();
                self.channel.send(ServerEvent::ConsumersResumed {
                    resumed: results.len() - failed,
                    failed,
                });
            }
            ClientRequest::GetParticipantStats => {
                let participant = self.participant()?;
                self.channel.send(ServerEvent::ParticipantStats {
                    stats: participant.stats(),
                });
            }
            ClientRequest::Disconnect => self.disconnect().await,
        }
        Ok(())
    }

    async fn join(&mut self, room_id: &RoomId) -> confab_sfu::Result<Arc<Room>> {
        if let Some(current) = &self.room {
            if current.id() != room_id {
                return Err(SfuError::protocol(format!(
                    "already joined room {}",
                    current.id()
                )));
            }
            if !current.is_closed() {
                return Ok(Arc::clone(current));
            }
        }

        let room = self.server.get_or_create_room(room_id).await?;
        info!(participant_id = %self.participant_id, room_id = %room_id, "Joined room");
        self.room = Some(Arc::clone(&room));
        self.attached = false;
        Ok(room)
    }

    async fn create_transport(
        &mut self,
        room_id: Option<RoomId>,
        direction: Option<TransportDirection>,
    ) -> confab_sfu::Result<()> {
        let room = match room_id {
            Some(room_id) => self.join(&room_id).await?,
            None => self.current_room()?,
        };

        let attached = self.attach_transport(&room, direction).await;
        let transport = match attached {
            // The room emptied and closed between join and this request;
            // rejoin its replacement once.
            Err(SfuError::RoomClosed(_) | SfuError::RoomNotFound(_)) => {
                debug!(participant_id = %self.participant_id, room_id = %room.id(), "Room closed under us, rejoining");
                let room = self.join(room.id()).await?;
                self.attach_transport(&room, direction).await?
            }
            other => other?,
        };

        self.channel
            .send(ServerEvent::transport_created(transport.as_ref(), direction));
        Ok(())
    }

    async fn attach_transport(
        &mut self,
        room: &Room,
        direction: Option<TransportDirection>,
    ) -> confab_sfu::Result<Arc<dyn EngineTransport>> {
        let transport = self.server.create_webrtc_transport(room.id()).await?;
        room.add_participant(
            self.participant_id.clone(),
            self.user_info.clone(),
            self.channel.clone(),
            direction,
            Arc::clone(&transport),
        )
        .await?;
        self.attached = true;
        Ok(transport)
    }

    fn current_room(&self) -> confab_sfu::Result<Arc<Room>> {
        self.room
            .clone()
            .ok_or_else(|| SfuError::NotJoined(self.participant_id.clone()))
    }

    fn participant(&self) -> confab_sfu::Result<Arc<Participant>> {
        self.current_room()?.participant(&self.participant_id)
    }

    /// Leave the current room; safe to call more than once
    pub async fn disconnect(&mut self) {
        if std::mem::replace(&mut self.disconnected, true) {
            return;
        }
        let Some(room) = self.room.take() else {
            return;
        };

        // Joined but never attached: the room may exist only because of us.
        if !self.attached {
            if room.close_if_empty().await {
                debug!(participant_id = %self.participant_id, room_id = %room.id(), "Closed room left empty");
            }
            return;
        }

        match room.remove_participant(&self.participant_id).await {
            Ok(()) => {
                info!(participant_id = %self.participant_id, room_id = %room.id(), "Participant disconnected");
            }
            Err(SfuError::ParticipantNotFound(_)) => {
                room.close_if_empty().await;
            }
            Err(e) => {
                warn!(participant_id = %self.participant_id, room_id = %room.id(), error = %e, "Failed to remove participant");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_requests() {
        let request: ClientRequest = serde_json::from_value(json!({
            "event": "create-webrtc-transport",
            "data": { "roomId": "r1", "direction": "recv" }
        }))
        .unwrap();
        assert!(matches!(
            request,
            ClientRequest::CreateWebrtcTransport {
                room_id: Some(ref room_id),
                direction: Some(TransportDirection::Recv),
            } if room_id.as_str() == "r1"
        ));

        let request: ClientRequest =
            serde_json::from_value(json!({ "event": "resume-all-consumers" })).unwrap();
        assert_eq!(request.name(), "resume-all-consumers");

        let request: ClientRequest = serde_json::from_value(json!({
            "event": "pause-producer",
            "data": { "kind": "screen-audio" }
        }))
        .unwrap();
        assert!(matches!(
            request,
            ClientRequest::PauseProducer {
                kind: MediaKind::ScreenAudio
            }
        ));
    }

    #[test]
    fn test_legacy_transport_request_has_no_direction() {
        let request: ClientRequest = serde_json::from_value(json!({
            "event": "create-webrtc-transport",
            "data": {}
        }))
        .unwrap();
        assert!(matches!(
            request,
            ClientRequest::CreateWebrtcTransport {
                room_id: None,
                direction: None
            }
        ));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result = serde_json::from_value::<ClientRequest>(json!({
            "event": "teleport",
            "data": {}
        }));
        assert!(result.is_err());
    }
}
