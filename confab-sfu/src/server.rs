//! Worker pool, room registry and transport allocation

use crate::config::SfuConfig;
use crate::engine::{EngineTransport, MediaEngine};
use crate::error::{Result, SfuError};
use crate::registry::RoomRegistry;
use crate::room::Room;
use crate::stats::ServerStats;
use crate::types::RoomId;
use crate::worker::Worker;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Top-level SFU instance
///
/// Rooms are spread over workers with a round-robin cursor. A worker that
/// dies after startup is fatal: [`SfuServer::wait_for_worker_death`]
/// resolves and the process is expected to exit.
pub struct SfuServer {
    config: SfuConfig,
    workers: Vec<Arc<Worker>>,
    next_worker: AtomicUsize,
    registry: Arc<RoomRegistry>,
    death_tx: Arc<watch::Sender<Option<String>>>,
    closed: AtomicBool,
}

impl SfuServer {
    /// Spawn the worker pool, one initial router per worker
    pub async fn init(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Result<Arc<Self>> {
        let count = config.worker_count(engine.supports_multiple_workers());
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let worker = Worker::spawn(index, engine.as_ref(), &config.worker, &config.media_codecs).await?;
            workers.push(worker);
        }
        if workers.is_empty() {
            return Err(SfuError::NoWorkers);
        }

        let (death_tx, _) = watch::channel(None);
        let death_tx = Arc::new(death_tx);
        for worker in &workers {
            watch_worker(worker, Arc::clone(&death_tx));
        }

        info!(workers = workers.len(), engine = engine.name(), "SFU server started");

        Ok(Arc::new(Self {
            config,
            workers,
            next_worker: AtomicUsize::new(0),
            registry: RoomRegistry::new(),
            death_tx,
            closed: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub const fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Round-robin, no load awareness
    #[must_use]
    pub fn next_worker(&self) -> Arc<Worker> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Arc::clone(&self.workers[index])
    }

    pub async fn get_or_create_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SfuError::ShuttingDown);
        }

        self.registry
            .get_or_create(room_id, |registry| async move {
                let worker = self.next_worker();
                let router = worker.router_for_room().await?;
                Ok(Room::new(
                    room_id.clone(),
                    router,
                    worker.index(),
                    self.config.max_participants_per_room,
                    registry,
                ))
            })
            .await
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.registry.get(room_id)
    }

    /// Open room `room_id`, or the reason there is none
    pub fn find_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        if self.is_closed() {
            return Err(SfuError::ShuttingDown);
        }
        self.room(room_id)
            .ok_or_else(|| SfuError::RoomNotFound(room_id.clone()))
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.registry.len()
    }

    /// Allocate a WebRTC transport on the room's router
    pub async fn create_webrtc_transport(&self, room_id: &RoomId) -> Result<Arc<dyn EngineTransport>> {
        let room = self.find_room(room_id)?;
        let transport = room
            .router()
            .create_webrtc_transport(&self.config.webrtc_transport)
            .await?;
        info!(room_id = %room_id, transport_id = %transport.id(), "WebRTC transport created");
        Ok(transport)
    }

    /// Aggregate counts plus per-worker resource usage
    pub async fn get_stats(&self) -> ServerStats {
        let rooms = self.registry.rooms();
        let rooms_detail: Vec<_> = rooms.iter().map(|room| room.stats()).collect();

        let workers = join_all(self.workers.iter().map(|worker| {
            let hosted = rooms
                .iter()
                .filter(|room| room.worker_index() == worker.index())
                .count();
            worker.stats(hosted)
        }))
        .await;

        ServerStats {
            rooms: rooms_detail.len(),
            participants: rooms_detail.iter().map(|room| room.participants).sum(),
            producers: rooms_detail.iter().map(|room| room.producers).sum(),
            consumers: rooms_detail.iter().map(|room| room.consumers).sum(),
            workers,
            rooms_detail,
        }
    }

    /// Resolves with [`SfuError::WorkerDied`] once any worker exits unexpectedly
    pub async fn wait_for_worker_death(&self) -> SfuError {
        let mut died = self.death_tx.subscribe();
        loop {
            let reason = died.borrow_and_update().clone();
            if let Some(reason) = reason {
                return SfuError::WorkerDied(reason);
            }
            if died.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Close every room, then every worker
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let rooms = self.registry.rooms();
        for room in &rooms {
            room.close().await;
        }
        for worker in &self.workers {
            worker.close().await;
        }
        info!(rooms = rooms.len(), "SFU server closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn watch_worker(worker: &Arc<Worker>, death_tx: Arc<watch::Sender<Option<String>>>) {
    let mut died = worker.died();
    let index = worker.index();
    let pid = worker.pid();

    tokio::spawn(async move {
        loop {
            let reason = died.borrow_and_update().clone();
            if let Some(reason) = reason {
                error!(worker_index = index, pid, reason = %reason, "Worker died, SFU cannot continue");
                death_tx.send_replace(Some(format!("worker {index} (pid {pid}): {reason}")));
                break;
            }
            if died.changed().await.is_err() {
                break;
            }
        }
    });
}
