//! Conferencing room
//!
//! A room owns one router and its participants and fans stream availability
//! out across them. It is OPEN until the last participant leaves or it is
//! closed explicitly; CLOSED is terminal and the room is evicted from the
//! registry.
//!
//! Fan-out (one producer to N consumers, or N producers to one newcomer) is
//! best effort: every attempt runs concurrently, all are awaited, and each
//! outcome is reported in a [`FanoutReport`]. A failed sibling never rolls
//! back the others.

use crate::consumer::ConsumerSummary;
use crate::engine::{EngineRouter, EngineTransport, ProducerId, RtpCapabilities, RtpParameters};
use crate::error::{Result, SfuError};
use crate::participant::Participant;
use crate::producer::ProducerSummary;
use crate::registry::RoomRegistry;
use crate::signaling::{ExistingParticipant, ServerEvent, SignalingChannel};
use crate::stats::RoomStats;
use crate::types::{MediaKind, ParticipantId, RoomId, TransportDirection, UserInfo};
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notifications raised inside a participant that the room has to act on
#[derive(Debug)]
pub(crate) enum RoomEvent {
    /// The engine closed a producer on its own (transport failure, worker exit)
    ProducerClosed {
        participant_id: ParticipantId,
        producer_id: ProducerId,
        kind: MediaKind,
    },
}

/// Result of one consumer creation inside a fan-out
#[derive(Debug)]
pub struct FanoutOutcome {
    /// The consuming participant
    pub participant_id: ParticipantId,
    pub producer_id: ProducerId,
    /// `Ok(None)` when the consumer's capabilities cannot receive the producer
    pub result: Result<Option<ConsumerSummary>>,
}

#[derive(Debug, Default)]
pub struct FanoutReport {
    pub outcomes: Vec<FanoutOutcome>,
}

impl FanoutReport {
    /// Consumers that exist after the fan-out
    #[must_use]
    pub fn created(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.result, Ok(Some(_))))
            .count()
    }

    /// Attempts skipped on capability mismatch
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.result, Ok(None)))
            .count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FanoutOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err())
    }

    fn log_failures(&self, room_id: &RoomId) {
        for outcome in self.failures() {
            if let Err(e) = &outcome.result {
                warn!(
                    room_id = %room_id,
                    participant_id = %outcome.participant_id,
                    producer_id = %outcome.producer_id,
                    error = %e,
                    "Consumer creation failed during fan-out"
                );
            }
        }
    }
}

pub struct Room {
    id: RoomId,
    router: Arc<dyn EngineRouter>,
    worker_index: usize,
    max_participants: usize,
    participants: RwLock<HashMap<ParticipantId, Arc<Participant>>>,
    closed: AtomicBool,
    registry: Weak<RoomRegistry>,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
}

impl Room {
    pub(crate) fn new(
        id: RoomId,
        router: Arc<dyn EngineRouter>,
        worker_index: usize,
        max_participants: usize,
        registry: Weak<RoomRegistry>,
    ) -> Arc<Self> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let room = Arc::new(Self {
            id,
            router,
            worker_index,
            max_participants,
            participants: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            registry,
            events_tx,
        });

        let weak = Arc::downgrade(&room);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(room) = weak.upgrade() else {
                    break;
                };
                room.handle_event(event).await;
            }
        });

        info!(
            room_id = %room.id,
            router_id = %room.router.id(),
            worker_index,
            "Room created"
        );
        room
    }

    async fn handle_event(&self, event: RoomEvent) {
        match event {
            RoomEvent::ProducerClosed {
                participant_id,
                producer_id,
                kind,
            } => {
                self.producer_closed(&participant_id, producer_id, kind).await;
            }
        }
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn router(&self) -> &Arc<dyn EngineRouter> {
        &self.router
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        self.router.rtp_capabilities()
    }

    #[must_use]
    pub const fn worker_index(&self) -> usize {
        self.worker_index
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.read().len()
    }

    #[must_use]
    pub fn participants(&self) -> Vec<Arc<Participant>> {
        self.participants.read().values().cloned().collect()
    }

    pub fn participant(&self, participant_id: &ParticipantId) -> Result<Arc<Participant>> {
        self.participants
            .read()
            .get(participant_id)
            .cloned()
            .ok_or_else(|| SfuError::ParticipantNotFound(participant_id.clone()))
    }

    fn others(&self, participant_id: &ParticipantId) -> Vec<Arc<Participant>> {
        self.participants
            .read()
            .values()
            .filter(|participant| participant.id() != participant_id)
            .cloned()
            .collect()
    }

    fn broadcast_except(&self, participant_id: &ParticipantId, event: &ServerEvent) {
        for participant in self.others(participant_id) {
            participant.send(event.clone());
        }
    }

    /// Add a participant together with its first transport.
    ///
    /// A participant already present gets `transport` attached instead, so
    /// the send and recv transport requests of one client both land here.
    /// That only works over the participant's own connection; a second
    /// connection under the same id is refused. The transport is closed if
    /// the participant cannot take it.
    pub async fn add_participant(
        &self,
        participant_id: ParticipantId,
        user_info: UserInfo,
        channel: SignalingChannel,
        direction: Option<TransportDirection>,
        transport: Arc<dyn EngineTransport>,
    ) -> Result<Arc<Participant>> {
        let admitted = {
            let mut participants = self.participants.write();
            if self.is_closed() {
                Err(SfuError::RoomClosed(self.id.clone()))
            } else if let Some(existing) = participants.get(&participant_id) {
                if existing.is_connected_through(&channel) {
                    Ok((Arc::clone(existing), false))
                } else {
                    Err(SfuError::AlreadyConnected(participant_id.clone()))
                }
            } else if self.max_participants > 0 && participants.len() >= self.max_participants {
                Err(SfuError::RoomFull(self.id.clone()))
            } else {
                let participant = Participant::new(
                    participant_id.clone(),
                    self.id.clone(),
                    user_info,
                    channel,
                    direction,
                    Arc::clone(&transport),
                    self.events_tx.clone(),
                );
                participants.insert(participant_id.clone(), Arc::clone(&participant));
                Ok((participant, true))
            }
        };

        let (participant, created) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        if !created {
            if let Err(e) = participant.set_transport(direction, Arc::clone(&transport)).await {
                transport.close().await;
                return Err(e);
            }
            debug!(
                room_id = %self.id,
                participant_id = %participant_id,
                direction = ?direction,
                "Transport attached to existing participant"
            );
            return Ok(participant);
        }

        info!(
            room_id = %self.id,
            participant_id = %participant_id,
            participants = self.participant_count(),
            "Participant joined"
        );

        self.broadcast_except(
            &participant_id,
            &ServerEvent::ParticipantJoined {
                participant_id: participant_id.clone(),
                user_info: participant.user_info().clone(),
            },
        );
        self.send_existing_participants(&participant).await;

        Ok(participant)
    }

    /// Tell a newcomer who is already here. Consumers are built right away
    /// only if the newcomer has declared capabilities; otherwise that waits
    /// for [`Room::set_rtp_capabilities`].
    pub async fn send_existing_participants(&self, newcomer: &Participant) -> Option<FanoutReport> {
        let existing: Vec<ExistingParticipant> = self
            .others(newcomer.id())
            .iter()
            .map(|participant| ExistingParticipant {
                participant_id: participant.id().clone(),
                user_info: participant.user_info().clone(),
                producers: participant.producers(),
            })
            .collect();
        newcomer.send(ServerEvent::ExistingParticipants {
            participants: existing,
        });

        if newcomer.has_rtp_capabilities() {
            Some(self.consume_existing(newcomer).await)
        } else {
            debug!(
                room_id = %self.id,
                participant_id = %newcomer.id(),
                "Deferring consumers until capabilities are declared"
            );
            None
        }
    }

    /// Build consumers on `target` for every producer of every other participant
    async fn consume_existing(&self, target: &Participant) -> FanoutReport {
        let sources: Vec<(ParticipantId, ProducerSummary)> = self
            .others(target.id())
            .iter()
            .flat_map(|source| {
                source
                    .producers()
                    .into_iter()
                    .map(|producer| (source.id().clone(), producer))
            })
            .collect();

        let outcomes = join_all(sources.iter().map(|(source, producer)| async move {
            FanoutOutcome {
                participant_id: target.id().clone(),
                producer_id: producer.producer_id,
                result: self.create_consumer(target, producer, source).await,
            }
        }))
        .await;

        let report = FanoutReport { outcomes };
        report.log_failures(&self.id);
        report
    }

    /// Offer a new producer to every other participant that declared capabilities
    pub async fn handle_new_producer(
        &self,
        participant_id: &ParticipantId,
        producer: &ProducerSummary,
    ) -> FanoutReport {
        let targets: Vec<Arc<Participant>> = self
            .others(participant_id)
            .into_iter()
            .filter(|participant| participant.has_rtp_capabilities())
            .collect();

        let outcomes = join_all(targets.iter().map(|target| async move {
            FanoutOutcome {
                participant_id: target.id().clone(),
                producer_id: producer.producer_id,
                result: self.create_consumer(target, producer, participant_id).await,
            }
        }))
        .await;

        let report = FanoutReport { outcomes };
        report.log_failures(&self.id);
        debug!(
            room_id = %self.id,
            producer_id = %producer.producer_id,
            created = report.created(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Producer fan-out finished"
        );
        report
    }

    /// `Ok(None)` when `participant` cannot receive `producer`; not an error
    pub async fn create_consumer(
        &self,
        participant: &Participant,
        producer: &ProducerSummary,
        producer_participant_id: &ParticipantId,
    ) -> Result<Option<ConsumerSummary>> {
        participant
            .create_consumer(self.router.as_ref(), producer, producer_participant_id)
            .await
    }

    /// Record capabilities and build consumers for every known producer
    pub async fn set_rtp_capabilities(
        &self,
        participant_id: &ParticipantId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<FanoutReport> {
        let participant = self.participant(participant_id)?;
        participant.set_rtp_capabilities(rtp_capabilities)?;
        Ok(self.consume_existing(&participant).await)
    }

    /// Create (or return) the participant's producer of `kind`. The fan-out
    /// report is present only when a new producer was created.
    pub async fn produce(
        &self,
        participant_id: &ParticipantId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<(ProducerSummary, Option<FanoutReport>)> {
        let participant = self.participant(participant_id)?;
        let (producer, created) = participant.produce(kind, rtp_parameters, app_data).await?;
        if !created {
            return Ok((producer, None));
        }
        let report = self.handle_new_producer(participant_id, &producer).await;
        Ok((producer, Some(report)))
    }

    pub async fn pause_producer(&self, participant_id: &ParticipantId, kind: MediaKind) -> Result<()> {
        let change = self.participant(participant_id)?.pause_producer(kind).await?;
        if let Some(change) = change {
            self.broadcast_state_change(participant_id, change.producer_id, kind, true);
        }
        Ok(())
    }

    pub async fn resume_producer(&self, participant_id: &ParticipantId, kind: MediaKind) -> Result<()> {
        let change = self.participant(participant_id)?.resume_producer(kind).await?;
        if let Some(change) = change {
            self.broadcast_state_change(participant_id, change.producer_id, kind, false);
        }
        Ok(())
    }

    fn broadcast_state_change(
        &self,
        participant_id: &ParticipantId,
        producer_id: ProducerId,
        kind: MediaKind,
        paused: bool,
    ) {
        self.broadcast_except(
            participant_id,
            &ServerEvent::ProducerStateChanged {
                participant_id: participant_id.clone(),
                producer_id,
                kind,
                paused,
            },
        );
    }

    pub async fn close_producer(
        &self,
        participant_id: &ParticipantId,
        kind: MediaKind,
    ) -> Result<ProducerSummary> {
        let producer = self.participant(participant_id)?.close_producer(kind).await?;
        self.producer_closed(participant_id, producer.producer_id, kind).await;
        Ok(producer)
    }

    /// Tear down every consumer of a closed producer and announce it
    async fn producer_closed(&self, participant_id: &ParticipantId, producer_id: ProducerId, kind: MediaKind) {
        let others = self.others(participant_id);
        join_all(
            others
                .iter()
                .map(|participant| participant.close_consumer_by_producer(&producer_id)),
        )
        .await;

        let event = ServerEvent::ProducerClosed {
            participant_id: participant_id.clone(),
            producer_id,
            kind,
        };
        for participant in &others {
            participant.send(event.clone());
        }
        debug!(
            room_id = %self.id,
            participant_id = %participant_id,
            producer_id = %producer_id,
            "Producer closed, consumers torn down"
        );
    }

    /// Close and remove a participant; the room closes once it is empty
    pub async fn remove_participant(&self, participant_id: &ParticipantId) -> Result<()> {
        let participant = self
            .participants
            .write()
            .remove(participant_id)
            .ok_or_else(|| SfuError::ParticipantNotFound(participant_id.clone()))?;

        let closed_producers = participant.close().await;
        for producer in closed_producers {
            self.producer_closed(participant_id, producer.producer_id, producer.kind)
                .await;
        }

        self.broadcast_except(
            participant_id,
            &ServerEvent::ParticipantLeft {
                participant_id: participant_id.clone(),
            },
        );
        info!(
            room_id = %self.id,
            participant_id = %participant_id,
            participants = self.participant_count(),
            "Participant left"
        );

        self.close_if_empty().await;
        Ok(())
    }

    /// Close the room if nobody is in it. Returns true if this call closed it.
    ///
    /// Covers rooms that were joined but never got a participant, as well as
    /// the last departure.
    pub async fn close_if_empty(&self) -> bool {
        let closing = {
            let participants = self.participants.write();
            participants.is_empty() && !self.closed.swap(true, Ordering::AcqRel)
        };
        if closing {
            self.shutdown().await;
        }
        closing
    }

    /// Forced close: participants are closed without departure announcements
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        let participants: Vec<Arc<Participant>> =
            self.participants.write().drain().map(|(_, p)| p).collect();
        for participant in &participants {
            participant.close().await;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.evict(self);
        }
        info!(
            room_id = %self.id,
            closed_participants = participants.len(),
            "Room closed"
        );
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let participants = self.participants();
        RoomStats {
            room_id: self.id.clone(),
            router_id: self.router.id(),
            worker_index: self.worker_index,
            closed: self.is_closed(),
            participants: participants.len(),
            producers: participants.iter().map(|p| p.producers().len()).sum(),
            consumers: participants.iter().map(|p| p.consumers().len()).sum(),
        }
    }
}
