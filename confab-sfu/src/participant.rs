//! One connected endpoint inside a room
//!
//! A participant owns its transports, a [`ProducerHandler`] and a
//! [`ConsumerHandler`]. Its lifecycle is CREATED → ACTIVE (first transport
//! connected) → CLOSED; close is terminal and idempotent, and cascades to
//! every producer, consumer and transport it owns.

use crate::consumer::{ConsumerHandler, ConsumerSummary};
use crate::engine::{
    ConsumerId, DtlsParameters, DtlsState, EngineRouter, EngineTransport, ProducerId,
    RtpCapabilities, RtpParameters, TransportEvent,
};
use crate::error::{Result, SfuError};
use crate::producer::{ProducerHandler, ProducerStateChange, ProducerSummary};
use crate::room::RoomEvent;
use crate::signaling::{ServerEvent, SignalingChannel};
use crate::stats::ParticipantStats;
use crate::types::{MediaKind, ParticipantId, RoomId, TransportDirection, UserInfo};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Created,
    Active,
    Closed,
}

impl ParticipantState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

/// Transports of a participant, fixed to one shape when the participant is created
///
/// `Legacy` clients negotiate a single transport used for both directions;
/// split-duplex clients use one per direction.
enum TransportSet {
    Legacy(Arc<dyn EngineTransport>),
    SplitDuplex {
        send: Option<Arc<dyn EngineTransport>>,
        recv: Option<Arc<dyn EngineTransport>>,
    },
}

impl TransportSet {
    fn new(direction: Option<TransportDirection>, transport: Arc<dyn EngineTransport>) -> Self {
        match direction {
            None => Self::Legacy(transport),
            Some(TransportDirection::Send) => Self::SplitDuplex {
                send: Some(transport),
                recv: None,
            },
            Some(TransportDirection::Recv) => Self::SplitDuplex {
                send: None,
                recv: Some(transport),
            },
        }
    }

    fn get(&self, direction: TransportDirection) -> Option<Arc<dyn EngineTransport>> {
        match (self, direction) {
            (Self::Legacy(transport), _) => Some(Arc::clone(transport)),
            (Self::SplitDuplex { send, .. }, TransportDirection::Send) => send.clone(),
            (Self::SplitDuplex { recv, .. }, TransportDirection::Recv) => recv.clone(),
        }
    }

    /// Store `transport`, returning the one it replaces
    fn replace(
        &mut self,
        direction: Option<TransportDirection>,
        transport: Arc<dyn EngineTransport>,
    ) -> std::result::Result<Option<Arc<dyn EngineTransport>>, &'static str> {
        match (self, direction) {
            (Self::Legacy(slot), None) => Ok(Some(std::mem::replace(slot, transport))),
            (Self::SplitDuplex { send, .. }, Some(TransportDirection::Send)) => {
                Ok(send.replace(transport))
            }
            (Self::SplitDuplex { recv, .. }, Some(TransportDirection::Recv)) => {
                Ok(recv.replace(transport))
            }
            (Self::Legacy(_), Some(_)) => {
                Err("participant uses a single transport; direction not allowed")
            }
            (Self::SplitDuplex { .. }, None) => {
                Err("participant uses split transports; direction required")
            }
        }
    }

    fn all(&self) -> Vec<Arc<dyn EngineTransport>> {
        match self {
            Self::Legacy(transport) => vec![Arc::clone(transport)],
            Self::SplitDuplex { send, recv } => send.iter().chain(recv.iter()).cloned().collect(),
        }
    }

    const fn mode(&self) -> &'static str {
        match self {
            Self::Legacy(_) => "legacy",
            Self::SplitDuplex { .. } => "split-duplex",
        }
    }
}

pub struct Participant {
    id: ParticipantId,
    room_id: RoomId,
    user_info: UserInfo,
    channel: SignalingChannel,
    state: Mutex<ParticipantState>,
    rtp_capabilities: RwLock<Option<RtpCapabilities>>,
    transports: RwLock<TransportSet>,
    producers: ProducerHandler,
    consumers: ConsumerHandler,
}

impl Participant {
    pub(crate) fn new(
        id: ParticipantId,
        room_id: RoomId,
        user_info: UserInfo,
        channel: SignalingChannel,
        direction: Option<TransportDirection>,
        transport: Arc<dyn EngineTransport>,
        room_events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Arc<Self> {
        let participant = Arc::new(Self {
            producers: ProducerHandler::new(id.clone(), room_events),
            consumers: ConsumerHandler::new(id.clone(), channel.clone()),
            transports: RwLock::new(TransportSet::new(direction, Arc::clone(&transport))),
            rtp_capabilities: RwLock::new(None),
            state: Mutex::new(ParticipantState::Created),
            id,
            room_id,
            user_info,
            channel,
        });
        participant.watch_transport(direction, &transport);
        participant
    }

    #[must_use]
    pub const fn id(&self) -> &ParticipantId {
        &self.id
    }

    #[must_use]
    pub const fn user_info(&self) -> &UserInfo {
        &self.user_info
    }

    #[must_use]
    pub fn state(&self) -> ParticipantState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ParticipantState::Closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::ParticipantClosed(self.id.clone()));
        }
        Ok(())
    }

    /// Push an event to this participant's signaling connection
    pub fn send(&self, event: ServerEvent) -> bool {
        self.channel.send(event)
    }

    pub(crate) fn is_connected_through(&self, channel: &SignalingChannel) -> bool {
        self.channel.same_connection(channel)
    }

    fn watch_transport(&self, direction: Option<TransportDirection>, transport: &Arc<dyn EngineTransport>) {
        let mut events = transport.subscribe();
        let transport_id = transport.id();
        let participant_id = self.id.clone();
        let room_id = self.room_id.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::DtlsStateChanged(DtlsState::Failed)) => {
                        warn!(
                            room_id = %room_id,
                            participant_id = %participant_id,
                            transport_id = %transport_id,
                            direction = ?direction,
                            "Transport DTLS failed"
                        );
                    }
                    Ok(TransportEvent::DtlsStateChanged(state)) => {
                        debug!(transport_id = %transport_id, state = ?state, "Transport DTLS state changed");
                    }
                    Ok(TransportEvent::Closed) | Err(RecvError::Closed) => {
                        debug!(transport_id = %transport_id, "Transport closed");
                        break;
                    }
                    Err(RecvError::Lagged(_)) => {}
                }
            }
        });
    }

    /// Attach a newly created transport. A transport already stored for the
    /// same direction is replaced and closed.
    pub async fn set_transport(
        &self,
        direction: Option<TransportDirection>,
        transport: Arc<dyn EngineTransport>,
    ) -> Result<()> {
        self.ensure_open()?;

        let replaced = self
            .transports
            .write()
            .replace(direction, Arc::clone(&transport))
            .map_err(SfuError::protocol)?;
        self.watch_transport(direction, &transport);

        if let Some(old) = replaced.filter(|old| old.id() != transport.id()) {
            warn!(
                participant_id = %self.id,
                transport_id = %old.id(),
                direction = ?direction,
                "Replacing existing transport"
            );
            old.close().await;
        }
        Ok(())
    }

    /// Resolve the transport serving `direction` (either one in legacy mode)
    #[must_use]
    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<dyn EngineTransport>> {
        self.transports.read().get(direction)
    }

    fn require_transport(&self, direction: TransportDirection) -> Result<Arc<dyn EngineTransport>> {
        self.transport(direction).ok_or_else(|| SfuError::MissingTransport {
            participant_id: self.id.clone(),
            direction,
        })
    }

    pub async fn connect_transport(
        &self,
        direction: Option<TransportDirection>,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        self.ensure_open()?;

        let transport = match direction {
            Some(direction) => self.require_transport(direction)?,
            None => match &*self.transports.read() {
                TransportSet::Legacy(transport) => Arc::clone(transport),
                TransportSet::SplitDuplex { .. } => {
                    return Err(SfuError::protocol(
                        "participant uses split transports; direction required",
                    ))
                }
            },
        };
        transport.connect(dtls_parameters).await?;

        let mut state = self.state.lock();
        if *state == ParticipantState::Created {
            *state = ParticipantState::Active;
        }
        info!(participant_id = %self.id, transport_id = %transport.id(), "Transport connected");
        Ok(())
    }

    /// Declare receive capabilities. Consumers are never created before this.
    pub fn set_rtp_capabilities(&self, rtp_capabilities: RtpCapabilities) -> Result<()> {
        self.ensure_open()?;
        *self.rtp_capabilities.write() = Some(rtp_capabilities);
        Ok(())
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.rtp_capabilities.read().clone()
    }

    #[must_use]
    pub fn has_rtp_capabilities(&self) -> bool {
        self.rtp_capabilities.read().is_some()
    }

    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<(ProducerSummary, bool)> {
        self.ensure_open()?;
        let transport = self.require_transport(TransportDirection::Send)?;
        self.producers.create(&transport, kind, rtp_parameters, app_data).await
    }

    pub async fn pause_producer(&self, kind: MediaKind) -> Result<Option<ProducerStateChange>> {
        self.producers.pause(kind).await
    }

    pub async fn resume_producer(&self, kind: MediaKind) -> Result<Option<ProducerStateChange>> {
        self.producers.resume(kind).await
    }

    pub async fn close_producer(&self, kind: MediaKind) -> Result<ProducerSummary> {
        self.producers.close(kind).await
    }

    #[must_use]
    pub fn producers(&self) -> Vec<ProducerSummary> {
        self.producers.producers()
    }

    /// Consume `producer` of participant `source`; `Ok(None)` on capability mismatch
    pub async fn create_consumer(
        &self,
        router: &dyn EngineRouter,
        producer: &ProducerSummary,
        source: &ParticipantId,
    ) -> Result<Option<ConsumerSummary>> {
        self.ensure_open()?;
        let rtp_capabilities = self.rtp_capabilities().ok_or_else(|| {
            SfuError::protocol(format!(
                "participant {} has not declared rtp capabilities",
                self.id
            ))
        })?;
        let transport = self.transport(TransportDirection::Recv);
        self.consumers
            .create_consumer(router, transport, &rtp_capabilities, producer, source)
            .await
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        self.consumers.resume_consumer(consumer_id).await
    }

    pub async fn pause_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        self.consumers.pause_consumer(consumer_id).await
    }

    pub async fn resume_all_consumers(&self) -> Vec<(ConsumerId, Result<()>)> {
        self.consumers.resume_all().await
    }

    pub async fn close_consumer_by_producer(&self, producer_id: &ProducerId) -> Option<ConsumerId> {
        self.consumers.close_consumer_by_producer(producer_id).await
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<ConsumerSummary> {
        self.consumers.consumers()
    }

    #[must_use]
    pub fn stats(&self) -> ParticipantStats {
        ParticipantStats {
            participant_id: self.id.clone(),
            user_info: self.user_info.clone(),
            state: self.state().as_str(),
            transport_mode: self.transports.read().mode(),
            rtp_capabilities_declared: self.has_rtp_capabilities(),
            producers: self.producers(),
            consumers: self.consumers(),
        }
    }

    /// Close everything this participant owns. Returns the producers that
    /// were open, so the room can tear down their consumers elsewhere.
    pub async fn close(&self) -> Vec<ProducerSummary> {
        {
            let mut state = self.state.lock();
            if *state == ParticipantState::Closed {
                return Vec::new();
            }
            *state = ParticipantState::Closed;
        }

        let closed = self.producers.close_all().await;
        self.consumers.close_all().await;
        let transports = self.transports.read().all();
        for transport in transports {
            transport.close().await;
        }

        info!(
            room_id = %self.room_id,
            participant_id = %self.id,
            producers = closed.len(),
            "Participant closed"
        );
        closed
    }
}
