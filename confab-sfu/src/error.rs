use crate::engine::{ConsumerId, EngineError};
use crate::types::{MediaKind, ParticipantId, RoomId, TransportDirection};
use serde::Serialize;
use thiserror::Error;

/// Broad failure classes. Capability mismatches are not errors at all:
/// consumer creation reports them as `Ok(None)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Operation requested out of order; only that operation is aborted
    ProtocolViolation,
    /// Capacity limits (no workers, room full)
    ResourceExhaustion,
    /// The native engine rejected the request or is gone
    EngineFailure,
    NotFound,
    Closed,
}

#[derive(Error, Debug, Clone)]
pub enum SfuError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("No {direction} transport for participant {participant_id}")]
    MissingTransport {
        participant_id: ParticipantId,
        direction: TransportDirection,
    },

    #[error("Participant {0} has not joined a room")]
    NotJoined(ParticipantId),

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Room closed: {0}")]
    RoomClosed(RoomId),

    #[error("Room full: {0}")]
    RoomFull(RoomId),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    #[error("Participant closed: {0}")]
    ParticipantClosed(ParticipantId),

    #[error("Participant {0} is already connected")]
    AlreadyConnected(ParticipantId),

    #[error("No {0} producer")]
    ProducerNotFound(MediaKind),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("No workers available")]
    NoWorkers,

    #[error("Worker died: {0}")]
    WorkerDied(String),

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl SfuError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolViolation(_)
            | Self::MissingTransport { .. }
            | Self::NotJoined(_)
            | Self::AlreadyConnected(_) => ErrorKind::ProtocolViolation,
            Self::RoomFull(_) | Self::NoWorkers => ErrorKind::ResourceExhaustion,
            Self::WorkerDied(_) | Self::Engine(_) => ErrorKind::EngineFailure,
            Self::RoomNotFound(_)
            | Self::ParticipantNotFound(_)
            | Self::ProducerNotFound(_)
            | Self::ConsumerNotFound(_) => ErrorKind::NotFound,
            Self::RoomClosed(_) | Self::ParticipantClosed(_) | Self::ShuttingDown => {
                ErrorKind::Closed
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let missing = SfuError::MissingTransport {
            participant_id: ParticipantId::from("alice"),
            direction: TransportDirection::Recv,
        };
        assert_eq!(missing.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(missing.to_string(), "No recv transport for participant alice");
        assert_eq!(SfuError::NoWorkers.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(
            SfuError::from(EngineError::TransportClosed).kind(),
            ErrorKind::EngineFailure
        );
    }
}
