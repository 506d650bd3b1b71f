//! Confab SFU core (Selective Forwarding Unit orchestration)
//!
//! This crate decides which stream goes to whom, when, and through which
//! engine worker. Media itself is handled by a native engine behind the
//! [`engine`] traits; the core only drives its object model.
//!
//! ## Architecture
//!
//! - **`SfuServer`**: Worker pool (round-robin), room registry, transport allocation
//! - **`Worker`**: One engine worker and the routers created on it
//! - **`Room`**: One session; owns a router and fans streams out across participants
//! - **`Participant`**: One endpoint; owns its transports, producers and consumers
//! - **`ProducerHandler`**: At most one outbound producer per media kind
//! - **`ConsumerHandler`**: One paused-on-creation consumer per remote producer
//!
//! ## Usage
//!
//! ```rust,ignore
//! use confab_sfu::{engine::LocalEngine, RoomId, SfuConfig, SfuServer};
//!
//! let server = SfuServer::init(SfuConfig::default(), Arc::new(LocalEngine::new())).await?;
//! let room = server.get_or_create_room(&RoomId::from("standup")).await?;
//! let transport = server.create_webrtc_transport(room.id()).await?;
//! let participant = room
//!     .add_participant(user_id, user_info, channel, Some(TransportDirection::Send), transport)
//!     .await?;
//! ```

mod config;
mod consumer;
pub mod engine;
mod error;
mod participant;
mod producer;
mod registry;
mod room;
mod server;
mod signaling;
mod stats;
#[cfg(test)]
mod testing;
mod types;
mod worker;

pub use config::{default_media_codecs, SfuConfig};
pub use consumer::{ConsumerHandler, ConsumerSummary};
pub use error::{ErrorKind, Result, SfuError};
pub use participant::{Participant, ParticipantState};
pub use producer::{ProducerHandler, ProducerStateChange, ProducerSummary};
pub use registry::RoomRegistry;
pub use room::{FanoutOutcome, FanoutReport, Room};
pub use server::SfuServer;
pub use signaling::{ExistingParticipant, ServerEvent, SignalingChannel};
pub use stats::{ParticipantStats, RoomStats, ServerStats, WorkerStats};
pub use types::{is_screen_share, MediaKind, ParticipantId, RoomId, TransportDirection, UserInfo};
pub use worker::Worker;
