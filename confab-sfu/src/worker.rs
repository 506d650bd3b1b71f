//! One native engine worker and the routers created on it

use crate::engine::{
    EngineRouter, EngineWorker, MediaEngine, RouterId, RtpCodecCapability, WorkerSettings,
};
use crate::error::Result;
use crate::stats::WorkerStats;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Worker {
    index: usize,
    inner: Arc<dyn EngineWorker>,
    media_codecs: Vec<RtpCodecCapability>,
    /// Insertion ordered so rooms prefer the oldest live router
    routers: Mutex<IndexMap<RouterId, Arc<dyn EngineRouter>>>,
    router_lock: tokio::sync::Mutex<()>,
}

impl Worker {
    /// Start a worker and its initial router
    pub async fn spawn(
        index: usize,
        engine: &dyn MediaEngine,
        settings: &WorkerSettings,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<Self>> {
        let inner = engine.create_worker(settings).await?;
        let router = inner.create_router(media_codecs).await?;

        let mut routers = IndexMap::new();
        routers.insert(router.id(), router);

        info!(
            worker_index = index,
            pid = inner.pid(),
            engine = engine.name(),
            "Worker started"
        );

        Ok(Arc::new(Self {
            index,
            inner,
            media_codecs: media_codecs.to_vec(),
            routers: Mutex::new(routers),
            router_lock: tokio::sync::Mutex::new(()),
        }))
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.inner.pid()
    }

    #[must_use]
    pub fn closed(&self) -> bool {
        self.inner.closed()
    }

    #[must_use]
    pub fn died(&self) -> watch::Receiver<Option<String>> {
        self.inner.died()
    }

    fn first_live_router(&self) -> Option<Arc<dyn EngineRouter>> {
        let mut routers = self.routers.lock();
        routers.retain(|_, router| !router.closed());
        routers.values().next().cloned()
    }

    /// Router for a new room: the existing one if any, otherwise a fresh one
    pub async fn router_for_room(&self) -> Result<Arc<dyn EngineRouter>> {
        if let Some(router) = self.first_live_router() {
            return Ok(router);
        }

        let _guard = self.router_lock.lock().await;
        if let Some(router) = self.first_live_router() {
            return Ok(router);
        }

        let router = self.inner.create_router(&self.media_codecs).await?;
        self.routers.lock().insert(router.id(), Arc::clone(&router));
        info!(worker_index = self.index, router_id = %router.id(), "Router created");
        Ok(router)
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers.lock().len()
    }

    #[must_use]
    pub fn routers(&self) -> Vec<Arc<dyn EngineRouter>> {
        self.routers.lock().values().cloned().collect()
    }

    pub async fn stats(&self, rooms: usize) -> WorkerStats {
        let resource_usage = match self.inner.resource_usage().await {
            Ok(usage) => Some(usage),
            Err(e) => {
                warn!(worker_index = self.index, error = %e, "Failed to query worker resource usage");
                None
            }
        };
        WorkerStats {
            worker_index: self.index,
            pid: self.pid(),
            routers: self.router_count(),
            rooms,
            resource_usage,
        }
    }

    pub async fn close(&self) {
        let routers: Vec<_> = self.routers.lock().drain(..).map(|(_, router)| router).collect();
        for router in routers {
            router.close().await;
        }
        self.inner.close().await;
        info!(worker_index = self.index, "Worker closed");
    }
}
