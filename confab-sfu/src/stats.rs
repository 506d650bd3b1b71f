//! Read-only statistics snapshots

use crate::consumer::ConsumerSummary;
use crate::engine::{ResourceUsage, RouterId};
use crate::producer::ProducerSummary;
use crate::types::{ParticipantId, RoomId, UserInfo};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantStats {
    pub participant_id: ParticipantId,
    pub user_info: UserInfo,
    pub state: &'static str,
    pub transport_mode: &'static str,
    pub rtp_capabilities_declared: bool,
    pub producers: Vec<ProducerSummary>,
    pub consumers: Vec<ConsumerSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: RoomId,
    pub router_id: RouterId,
    pub worker_index: usize,
    pub closed: bool,
    pub participants: usize,
    pub producers: usize,
    pub consumers: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub worker_index: usize,
    pub pid: u32,
    pub routers: usize,
    pub rooms: usize,
    /// None when the worker could not be queried (closed or dead)
    pub resource_usage: Option<ResourceUsage>,
}

/// Aggregate served on the management surface
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub rooms: usize,
    pub participants: usize,
    pub producers: usize,
    pub consumers: usize,
    pub workers: Vec<WorkerStats>,
    pub rooms_detail: Vec<RoomStats>,
}
