//! Outbound media of one participant
//!
//! A participant owns at most one producer per [`MediaKind`]. Each producer
//! moves ACTIVE ⇄ PAUSED and ends CLOSED; closing frees the slot so a new
//! producer of the same kind can be created later.

use crate::engine::{
    EngineProducer, EngineTransport, ProducerEvent, ProducerId, ProducerOptions, RtpParameters,
};
use crate::error::{Result, SfuError};
use crate::room::RoomEvent;
use crate::types::{is_screen_share, MediaKind, ParticipantId};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Snapshot of one producer, as announced to other participants
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub app_data: Value,
    pub paused: bool,
}

impl ProducerSummary {
    #[must_use]
    pub fn is_screen_share(&self) -> bool {
        self.kind.is_screen() || is_screen_share(&self.app_data)
    }
}

/// Pause/resume transition to be pushed to consuming participants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerStateChange {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
}

struct ProducerInfo {
    kind: MediaKind,
    producer: Arc<dyn EngineProducer>,
    app_data: Value,
}

impl ProducerInfo {
    fn summary(&self) -> ProducerSummary {
        ProducerSummary {
            producer_id: self.producer.id(),
            kind: self.kind,
            app_data: self.app_data.clone(),
            paused: self.producer.paused(),
        }
    }
}

type Slots = Mutex<BTreeMap<MediaKind, ProducerInfo>>;

pub struct ProducerHandler {
    participant_id: ParticipantId,
    slots: Arc<Slots>,
    /// Serializes creation so two concurrent requests for one kind yield one producer
    create_lock: tokio::sync::Mutex<()>,
    room_events: mpsc::UnboundedSender<RoomEvent>,
}

impl ProducerHandler {
    pub(crate) fn new(
        participant_id: ParticipantId,
        room_events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Self {
        Self {
            participant_id,
            slots: Arc::new(Mutex::new(BTreeMap::new())),
            create_lock: tokio::sync::Mutex::new(()),
            room_events,
        }
    }

    /// Create the producer for `kind`, or return the one already present.
    ///
    /// The boolean is true only when a new producer was created.
    pub async fn create(
        &self,
        transport: &Arc<dyn EngineTransport>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<(ProducerSummary, bool)> {
        let _guard = self.create_lock.lock().await;

        if let Some(existing) = self.live_slot(kind) {
            debug!(
                participant_id = %self.participant_id,
                kind = %kind,
                producer_id = %existing.producer_id,
                "Producer already exists, returning it"
            );
            return Ok((existing, false));
        }

        let app_data = tag_app_data(kind, app_data);
        let producer = transport
            .produce(ProducerOptions {
                kind: kind.media_type(),
                rtp_parameters,
                paused: false,
                app_data: app_data.clone(),
            })
            .await?;
        let events = producer.subscribe();
        let producer_id = producer.id();

        let info = ProducerInfo {
            kind,
            producer,
            app_data,
        };
        let summary = info.summary();
        self.slots.lock().insert(kind, info);
        self.spawn_listener(kind, producer_id, events);

        info!(
            participant_id = %self.participant_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok((summary, true))
    }

    /// Slot content, dropping a producer the engine already closed. Whoever
    /// removes a closed producer from its slot reports it to the room.
    fn live_slot(&self, kind: MediaKind) -> Option<ProducerSummary> {
        let mut slots = self.slots.lock();
        if slots.get(&kind).is_some_and(|info| info.producer.closed()) {
            if let Some(stale) = slots.remove(&kind) {
                let _ = self.room_events.send(RoomEvent::ProducerClosed {
                    participant_id: self.participant_id.clone(),
                    producer_id: stale.producer.id(),
                    kind,
                });
            }
        }
        slots.get(&kind).map(ProducerInfo::summary)
    }

    /// Watch for engine-initiated closes (transport failure, worker death)
    fn spawn_listener(
        &self,
        kind: MediaKind,
        producer_id: ProducerId,
        mut events: broadcast::Receiver<ProducerEvent>,
    ) {
        let slots = Arc::downgrade(&self.slots);
        let room_events = self.room_events.clone();
        let participant_id = self.participant_id.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProducerEvent::Closed) => {
                        let removed = slots.upgrade().is_some_and(|slots| {
                            let mut slots = slots.lock();
                            let ours = slots
                                .get(&kind)
                                .is_some_and(|info| info.producer.id() == producer_id);
                            if ours {
                                slots.remove(&kind);
                            }
                            ours
                        });
                        if removed {
                            warn!(
                                participant_id = %participant_id,
                                producer_id = %producer_id,
                                kind = %kind,
                                "Producer closed by engine"
                            );
                            let _ = room_events.send(RoomEvent::ProducerClosed {
                                participant_id,
                                producer_id,
                                kind,
                            });
                        }
                        break;
                    }
                    Ok(ProducerEvent::Paused | ProducerEvent::Resumed) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(producer_id = %producer_id, skipped, "Producer event listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn pause(&self, kind: MediaKind) -> Result<Option<ProducerStateChange>> {
        self.set_paused(kind, true).await
    }

    pub async fn resume(&self, kind: MediaKind) -> Result<Option<ProducerStateChange>> {
        self.set_paused(kind, false).await
    }

    /// None when the producer was already in the requested state
    async fn set_paused(&self, kind: MediaKind, paused: bool) -> Result<Option<ProducerStateChange>> {
        let producer = self.producer(kind).ok_or(SfuError::ProducerNotFound(kind))?;
        if producer.paused() == paused {
            return Ok(None);
        }

        if paused {
            producer.pause().await?;
        } else {
            producer.resume().await?;
        }

        info!(
            participant_id = %self.participant_id,
            producer_id = %producer.id(),
            kind = %kind,
            paused,
            "Producer state changed"
        );
        Ok(Some(ProducerStateChange {
            producer_id: producer.id(),
            kind,
            paused,
        }))
    }

    pub async fn close(&self, kind: MediaKind) -> Result<ProducerSummary> {
        let info = self
            .slots
            .lock()
            .remove(&kind)
            .ok_or(SfuError::ProducerNotFound(kind))?;
        let summary = info.summary();
        info.producer.close().await;

        info!(
            participant_id = %self.participant_id,
            producer_id = %summary.producer_id,
            kind = %kind,
            "Producer closed"
        );
        Ok(summary)
    }

    /// Close every producer; returns what was closed
    pub async fn close_all(&self) -> Vec<ProducerSummary> {
        let drained: Vec<ProducerInfo> = std::mem::take(&mut *self.slots.lock())
            .into_values()
            .collect();
        let mut closed = Vec::with_capacity(drained.len());
        for info in drained {
            closed.push(info.summary());
            info.producer.close().await;
        }
        closed
    }

    #[must_use]
    pub fn producer(&self, kind: MediaKind) -> Option<Arc<dyn EngineProducer>> {
        self.slots
            .lock()
            .get(&kind)
            .filter(|info| !info.producer.closed())
            .map(|info| Arc::clone(&info.producer))
    }

    #[must_use]
    pub fn producers(&self) -> Vec<ProducerSummary> {
        self.slots
            .lock()
            .values()
            .filter(|info| !info.producer.closed())
            .map(ProducerInfo::summary)
            .collect()
    }

    #[must_use]
    pub fn find(&self, producer_id: &ProducerId) -> Option<ProducerSummary> {
        self.slots
            .lock()
            .values()
            .find(|info| info.producer.id() == *producer_id)
            .map(ProducerInfo::summary)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// Screen-share producers are tagged so consumers can route them to the right slot
fn tag_app_data(kind: MediaKind, app_data: Value) -> Value {
    let mut map = match app_data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    if kind.is_screen() {
        map.entry("share").or_insert(Value::Bool(true));
    }
    Value::Object(map)
}
