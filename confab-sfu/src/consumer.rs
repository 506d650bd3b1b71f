//! Inbound media of one participant
//!
//! Every consumer starts paused; the client resumes it once its local
//! receiver is wired up. At most one consumer exists per source producer.
//!
//! Engine events are the single path by which consumer state changes reach
//! the client: each consumer gets a listener task that updates the table and
//! forwards the matching [`ServerEvent`]. Teardown the core initiates itself
//! removes the entry first, so the listener stays silent for it.

use crate::engine::{
    ConsumerEvent, ConsumerId, ConsumerOptions, EngineConsumer, EngineRouter, EngineTransport,
    ProducerId, RtpCapabilities,
};
use crate::error::{Result, SfuError};
use crate::producer::ProducerSummary;
use crate::signaling::{ServerEvent, SignalingChannel};
use crate::types::{MediaKind, ParticipantId, TransportDirection};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSummary {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    /// Participant whose producer this consumer receives
    pub participant_id: ParticipantId,
    pub kind: MediaKind,
    pub paused: bool,
    pub producer_paused: bool,
    /// Resumed at least once by the client
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_resume_attempt: Option<DateTime<Utc>>,
}

struct ConsumerInfo {
    consumer: Arc<dyn EngineConsumer>,
    producer_id: ProducerId,
    source: ParticipantId,
    kind: MediaKind,
    paused: bool,
    producer_paused: bool,
    ready: bool,
    last_resume_attempt: Option<DateTime<Utc>>,
}

impl ConsumerInfo {
    fn summary(&self) -> ConsumerSummary {
        ConsumerSummary {
            consumer_id: self.consumer.id(),
            producer_id: self.producer_id,
            participant_id: self.source.clone(),
            kind: self.kind,
            paused: self.paused,
            producer_paused: self.producer_paused,
            ready: self.ready,
            last_resume_attempt: self.last_resume_attempt,
        }
    }
}

#[derive(Default)]
struct ConsumerTable {
    by_id: HashMap<ConsumerId, ConsumerInfo>,
    by_producer: HashMap<ProducerId, ConsumerId>,
}

impl ConsumerTable {
    fn insert(&mut self, info: ConsumerInfo) {
        let consumer_id = info.consumer.id();
        self.by_producer.insert(info.producer_id, consumer_id);
        self.by_id.insert(consumer_id, info);
    }

    fn remove(&mut self, consumer_id: &ConsumerId) -> Option<ConsumerInfo> {
        let info = self.by_id.remove(consumer_id)?;
        if self.by_producer.get(&info.producer_id) == Some(consumer_id) {
            self.by_producer.remove(&info.producer_id);
        }
        Some(info)
    }

    fn remove_by_producer(&mut self, producer_id: &ProducerId) -> Option<ConsumerInfo> {
        let consumer_id = self.by_producer.remove(producer_id)?;
        self.by_id.remove(&consumer_id)
    }

    fn get_by_producer(&self, producer_id: &ProducerId) -> Option<&ConsumerInfo> {
        self.by_producer
            .get(producer_id)
            .and_then(|consumer_id| self.by_id.get(consumer_id))
    }
}

pub struct ConsumerHandler {
    participant_id: ParticipantId,
    channel: SignalingChannel,
    table: Arc<Mutex<ConsumerTable>>,
    create_lock: tokio::sync::Mutex<()>,
}

impl ConsumerHandler {
    pub(crate) fn new(participant_id: ParticipantId, channel: SignalingChannel) -> Self {
        Self {
            participant_id,
            channel,
            table: Arc::new(Mutex::new(ConsumerTable::default())),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a paused consumer of `producer` on the recv transport.
    ///
    /// Returns `Ok(None)` when the router cannot route the producer to these
    /// capabilities, and the existing consumer when one is already present.
    pub async fn create_consumer(
        &self,
        router: &dyn EngineRouter,
        transport: Option<Arc<dyn EngineTransport>>,
        rtp_capabilities: &RtpCapabilities,
        producer: &ProducerSummary,
        source: &ParticipantId,
    ) -> Result<Option<ConsumerSummary>> {
        if !router.can_consume(&producer.producer_id, rtp_capabilities) {
            debug!(
                participant_id = %self.participant_id,
                producer_id = %producer.producer_id,
                "Capabilities cannot consume producer, skipping"
            );
            return Ok(None);
        }

        let _guard = self.create_lock.lock().await;

        if let Some(existing) = self.find_by_producer(&producer.producer_id) {
            return Ok(Some(existing));
        }

        let transport = transport.ok_or_else(|| SfuError::MissingTransport {
            participant_id: self.participant_id.clone(),
            direction: TransportDirection::Recv,
        })?;

        let consumer = transport
            .consume(ConsumerOptions {
                producer_id: producer.producer_id,
                rtp_capabilities: rtp_capabilities.clone(),
                paused: true,
            })
            .await?;
        let events = consumer.subscribe();
        if consumer.closed() {
            // Source went away between consume and subscribe
            return Ok(None);
        }

        let consumer_id = consumer.id();
        let info = ConsumerInfo {
            kind: MediaKind::from_media(consumer.kind(), producer.is_screen_share()),
            producer_id: producer.producer_id,
            source: source.clone(),
            paused: consumer.paused(),
            producer_paused: consumer.producer_paused(),
            ready: false,
            last_resume_attempt: None,
            consumer: Arc::clone(&consumer),
        };
        let summary = info.summary();
        self.table.lock().insert(info);
        self.spawn_listener(consumer_id, events);

        info!(
            participant_id = %self.participant_id,
            consumer_id = %consumer_id,
            producer_id = %producer.producer_id,
            source = %source,
            kind = %summary.kind,
            "Consumer created"
        );

        self.channel.send(ServerEvent::NewConsumer {
            participant_id: source.clone(),
            producer_id: producer.producer_id,
            consumer_id,
            kind: summary.kind,
            rtp_parameters: consumer.rtp_parameters(),
            producer_paused: summary.producer_paused,
            consumer_paused: summary.paused,
            app_data: producer.app_data.clone(),
        });

        Ok(Some(summary))
    }

    fn spawn_listener(&self, consumer_id: ConsumerId, mut events: broadcast::Receiver<ConsumerEvent>) {
        let table = Arc::downgrade(&self.table);
        let channel = self.channel.clone();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(consumer_id = %consumer_id, skipped, "Consumer event listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(table) = table.upgrade() else {
                    break;
                };
                if !apply_event(&table, &channel, consumer_id, event) {
                    break;
                }
            }
        });
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        let consumer = {
            let mut table = self.table.lock();
            let info = table
                .by_id
                .get_mut(&consumer_id)
                .ok_or(SfuError::ConsumerNotFound(consumer_id))?;
            info.last_resume_attempt = Some(Utc::now());
            if !info.paused {
                return Ok(());
            }
            Arc::clone(&info.consumer)
        };

        match consumer.resume().await {
            Ok(()) => {
                if let Some(info) = self.table.lock().by_id.get_mut(&consumer_id) {
                    info.paused = false;
                    info.ready = true;
                }
                debug!(participant_id = %self.participant_id, consumer_id = %consumer_id, "Consumer resumed");
                Ok(())
            }
            Err(e) => {
                warn!(
                    participant_id = %self.participant_id,
                    consumer_id = %consumer_id,
                    error = %e,
                    "Failed to resume consumer"
                );
                self.channel.send(ServerEvent::ConsumerError {
                    consumer_id,
                    message: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    pub async fn pause_consumer(&self, consumer_id: ConsumerId) -> Result<()> {
        let consumer = {
            let table = self.table.lock();
            let info = table
                .by_id
                .get(&consumer_id)
                .ok_or(SfuError::ConsumerNotFound(consumer_id))?;
            if info.paused {
                return Ok(());
            }
            Arc::clone(&info.consumer)
        };

        consumer.pause().await?;
        if let Some(info) = self.table.lock().by_id.get_mut(&consumer_id) {
            info.paused = true;
        }
        Ok(())
    }

    /// Resume every paused consumer concurrently; one failure does not stop the rest
    pub async fn resume_all(&self) -> Vec<(ConsumerId, Result<()>)> {
        let paused: Vec<ConsumerId> = self
            .table
            .lock()
            .by_id
            .values()
            .filter(|info| info.paused)
            .map(|info| info.consumer.id())
            .collect();

        let results = join_all(
            paused
                .into_iter()
                .map(|consumer_id| async move { (consumer_id, self.resume_consumer(consumer_id).await) }),
        )
        .await;

        let failed = results.iter().filter(|(_, result)| result.is_err()).count();
        if failed > 0 {
            warn!(
                participant_id = %self.participant_id,
                resumed = results.len() - failed,
                failed,
                "Some consumers failed to resume"
            );
        }
        results
    }

    /// Close the consumer fed by `producer_id`, telling the client once
    pub async fn close_consumer_by_producer(&self, producer_id: &ProducerId) -> Option<ConsumerId> {
        let info = self.table.lock().remove_by_producer(producer_id)?;
        let consumer_id = info.consumer.id();

        self.channel.send(ServerEvent::ConsumerProducerClosed {
            consumer_id,
            producer_id: *producer_id,
        });
        info.consumer.close().await;

        debug!(
            participant_id = %self.participant_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            "Consumer closed with its producer"
        );
        Some(consumer_id)
    }

    /// Close everything without notifying the client
    pub async fn close_all(&self) {
        let drained: Vec<ConsumerInfo> = {
            let mut table = self.table.lock();
            table.by_producer.clear();
            table.by_id.drain().map(|(_, info)| info).collect()
        };
        for info in drained {
            info.consumer.close().await;
        }
    }

    #[must_use]
    pub fn find_by_producer(&self, producer_id: &ProducerId) -> Option<ConsumerSummary> {
        self.table
            .lock()
            .get_by_producer(producer_id)
            .map(ConsumerInfo::summary)
    }

    #[must_use]
    pub fn get(&self, consumer_id: &ConsumerId) -> Option<ConsumerSummary> {
        self.table.lock().by_id.get(consumer_id).map(ConsumerInfo::summary)
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<ConsumerSummary> {
        self.table.lock().by_id.values().map(ConsumerInfo::summary).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().by_id.is_empty()
    }
}

/// Returns false once the consumer is gone and the listener should stop
fn apply_event(
    table: &Mutex<ConsumerTable>,
    channel: &SignalingChannel,
    consumer_id: ConsumerId,
    event: ConsumerEvent,
) -> bool {
    match event {
        ConsumerEvent::Paused | ConsumerEvent::Resumed => {
            let paused = event == ConsumerEvent::Paused;
            let known = table
                .lock()
                .by_id
                .get_mut(&consumer_id)
                .map(|info| info.paused = paused)
                .is_some();
            if known {
                channel.send(if paused {
                    ServerEvent::ConsumerPaused { consumer_id }
                } else {
                    ServerEvent::ConsumerResumed { consumer_id }
                });
            }
            known
        }
        ConsumerEvent::ProducerPaused | ConsumerEvent::ProducerResumed => {
            let paused = event == ConsumerEvent::ProducerPaused;
            let producer_id = table.lock().by_id.get_mut(&consumer_id).map(|info| {
                info.producer_paused = paused;
                info.producer_id
            });
            let Some(producer_id) = producer_id else {
                return false;
            };
            channel.send(if paused {
                ServerEvent::ConsumerProducerPaused {
                    consumer_id,
                    producer_id,
                }
            } else {
                ServerEvent::ConsumerProducerResumed {
                    consumer_id,
                    producer_id,
                }
            });
            true
        }
        ConsumerEvent::ProducerClosed | ConsumerEvent::Closed => {
            let removed = table.lock().remove(&consumer_id);
            if let Some(info) = removed {
                let producer_id = info.producer_id;
                channel.send(if event == ConsumerEvent::ProducerClosed {
                    ServerEvent::ConsumerProducerClosed {
                        consumer_id,
                        producer_id,
                    }
                } else {
                    ServerEvent::ConsumerClosed {
                        consumer_id,
                        producer_id,
                    }
                });
            }
            false
        }
    }
}
