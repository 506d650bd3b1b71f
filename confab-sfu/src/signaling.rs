//! Events pushed to a participant's signaling connection

use crate::engine::{
    ConsumerId, DtlsParameters, EngineTransport, IceCandidate, IceParameters, ProducerId,
    RtpCapabilities, RtpParameters, SctpParameters, TransportId,
};
use crate::producer::ProducerSummary;
use crate::stats::ParticipantStats;
use crate::types::{MediaKind, ParticipantId, TransportDirection, UserInfo};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A participant already in the room, as announced to a newcomer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingParticipant {
    pub participant_id: ParticipantId,
    pub user_info: UserInfo,
    pub producers: Vec<ProducerSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    RouterRtpCapabilities {
        rtp_capabilities: RtpCapabilities,
    },
    WebrtcTransportCreated {
        id: TransportId,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
        #[serde(skip_serializing_if = "Option::is_none")]
        sctp_parameters: Option<SctpParameters>,
        #[serde(skip_serializing_if = "Option::is_none")]
        direction: Option<TransportDirection>,
    },
    WebrtcTransportConnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        direction: Option<TransportDirection>,
    },
    ProducerCreated {
        producer_id: ProducerId,
        kind: MediaKind,
        app_data: Value,
    },
    NewConsumer {
        participant_id: ParticipantId,
        producer_id: ProducerId,
        consumer_id: ConsumerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        producer_paused: bool,
        consumer_paused: bool,
        app_data: Value,
    },
    ConsumerResumed {
        consumer_id: ConsumerId,
    },
    ConsumerPaused {
        consumer_id: ConsumerId,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    ConsumerError {
        consumer_id: ConsumerId,
        message: String,
    },
    ConsumerProducerPaused {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    ConsumerProducerResumed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    ConsumerProducerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    ConsumersResumed {
        resumed: usize,
        failed: usize,
    },
    ParticipantJoined {
        participant_id: ParticipantId,
        user_info: UserInfo,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    ProducerClosed {
        participant_id: ParticipantId,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    ProducerStateChanged {
        participant_id: ParticipantId,
        producer_id: ProducerId,
        kind: MediaKind,
        paused: bool,
    },
    ExistingParticipants {
        participants: Vec<ExistingParticipant>,
    },
    ParticipantStats {
        stats: ParticipantStats,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Public connection parameters of a freshly allocated transport
    pub fn transport_created(
        transport: &dyn EngineTransport,
        direction: Option<TransportDirection>,
    ) -> Self {
        Self::WebrtcTransportCreated {
            id: transport.id(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
            sctp_parameters: transport.sctp_parameters(),
            direction,
        }
    }

    /// Wire name of the event
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RouterRtpCapabilities { .. } => "router-rtp-capabilities",
            Self::WebrtcTransportCreated { .. } => "webrtc-transport-created",
            Self::WebrtcTransportConnected { .. } => "webrtc-transport-connected",
            Self::ProducerCreated { .. } => "producer-created",
            Self::NewConsumer { .. } => "new-consumer",
            Self::ConsumerResumed { .. } => "consumer-resumed",
            Self::ConsumerPaused { .. } => "consumer-paused",
            Self::ConsumerClosed { .. } => "consumer-closed",
            Self::ConsumerError { .. } => "consumer-error",
            Self::ConsumerProducerPaused { .. } => "consumer-producer-paused",
            Self::ConsumerProducerResumed { .. } => "consumer-producer-resumed",
            Self::ConsumerProducerClosed { .. } => "consumer-producer-closed",
            Self::ConsumersResumed { .. } => "consumers-resumed",
            Self::ParticipantJoined { .. } => "participant-joined",
            Self::ParticipantLeft { .. } => "participant-left",
            Self::ProducerClosed { .. } => "producer-closed",
            Self::ProducerStateChanged { .. } => "producer-state-changed",
            Self::ExistingParticipants { .. } => "existing-participants",
            Self::ParticipantStats { .. } => "participant-stats",
            Self::Error { .. } => "error",
        }
    }
}

/// Outbound half of one participant's signaling connection
///
/// Bounded so a slow client cannot grow server memory; events that do not
/// fit are dropped with a warning.
#[derive(Debug, Clone)]
pub struct SignalingChannel {
    participant_id: ParticipantId,
    sender: mpsc::Sender<ServerEvent>,
}

impl SignalingChannel {
    pub fn new(participant_id: ParticipantId, sender: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            participant_id,
            sender,
        }
    }

    /// Create a channel together with its receiving end
    #[must_use]
    pub fn pair(
        participant_id: ParticipantId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(participant_id, sender), receiver)
    }

    /// Returns false if the event was dropped
    pub fn send(&self, event: ServerEvent) -> bool {
        let name = event.name();
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    participant_id = %self.participant_id,
                    event = name,
                    "Signaling channel full, client too slow; event dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    participant_id = %self.participant_id,
                    event = name,
                    "Signaling channel closed; event dropped"
                );
                false
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Whether both handles feed the same connection
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        self.sender.same_channel(&other.sender)
    }

    #[must_use]
    pub const fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = ServerEvent::ParticipantLeft {
            participant_id: ParticipantId::from("alice"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "participant-left");
        assert_eq!(json["data"]["participantId"], "alice");
        assert_eq!(event.name(), "participant-left");
    }

    #[test]
    fn test_state_change_fields_are_camel_case() {
        let event = ServerEvent::ProducerStateChanged {
            participant_id: ParticipantId::from("alice"),
            producer_id: ProducerId::new(),
            kind: MediaKind::ScreenVideo,
            paused: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "producer-state-changed");
        assert_eq!(json["data"]["kind"], "screen-video");
        assert!(json["data"]["producerId"].is_string());
    }

    #[tokio::test]
    async fn test_full_channel_drops() {
        let (channel, mut rx) = SignalingChannel::pair(ParticipantId::from("bob"), 1);
        assert!(channel.send(ServerEvent::error("one")));
        assert!(!channel.send(ServerEvent::error("two")));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ServerEvent::Error { message } if message == "one"));

        drop(rx);
        assert!(!channel.send(ServerEvent::error("three")));
        assert!(channel.is_closed());
    }
}
