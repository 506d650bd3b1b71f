//! Native media engine seam
//!
//! The orchestration core never touches media. It drives an engine through
//! the worker → router → transport → producer/consumer object model defined
//! here. Engine objects report lifecycle changes on broadcast channels; the
//! core subscribes where one state change has to reach many listeners.
//!
//! [`LocalEngine`] is the bundled in-process implementation.

mod local;
pub mod rtp;

pub use local::{LocalEngine, LocalWorker};
pub use rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceParameters, MediaType,
    Protocol, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension, RtpHeaderExtensionParameters,
    RtpParameters, SctpParameters,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

engine_id!(
    /// Identifier of a router inside an engine worker
    RouterId
);
engine_id!(
    /// Identifier of a WebRTC transport
    TransportId
);
engine_id!(
    /// Identifier of a producer (inbound stream)
    ProducerId
);
engine_id!(
    /// Identifier of a consumer (forwarded copy of a producer)
    ConsumerId
);

/// Engine-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Worker spawn failed: {0}")]
    Spawn(String),

    #[error("Worker closed")]
    WorkerClosed,

    #[error("Router closed")]
    RouterClosed,

    #[error("Transport closed")]
    TransportClosed,

    #[error("Transport already connected")]
    AlreadyConnected,

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Producer closed")]
    ProducerClosed,

    #[error("Consumer closed")]
    ConsumerClosed,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Settings applied to each spawned worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub log_level: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

/// IP the transports listen on, optionally announced under a public address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenIp {
    pub ip: String,
    #[serde(default)]
    pub announced_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumSctpStreams {
    pub os: u16,
    pub mis: u16,
}

impl Default for NumSctpStreams {
    fn default() -> Self {
        Self { os: 1024, mis: 1024 }
    }
}

/// Options for `EngineRouter::create_webrtc_transport`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: "127.0.0.1".to_string(),
                announced_ip: None,
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: 262_144,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub kind: MediaType,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub app_data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

/// Resource usage snapshot of one worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    DtlsStateChanged(DtlsState),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerEvent {
    Paused,
    Resumed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    Paused,
    Resumed,
    Closed,
    ProducerPaused,
    ProducerResumed,
    ProducerClosed,
}

/// Factory for engine workers
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether several workers may run side by side on this host
    fn supports_multiple_workers(&self) -> bool {
        true
    }

    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn EngineWorker>>;
}

#[async_trait]
pub trait EngineWorker: Send + Sync {
    fn pid(&self) -> u32;

    fn closed(&self) -> bool;

    /// Watch that flips to `Some(reason)` when the worker dies unexpectedly
    fn died(&self) -> watch::Receiver<Option<String>>;

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn EngineRouter>>;

    async fn resource_usage(&self) -> EngineResult<ResourceUsage>;

    async fn close(&self);
}

#[async_trait]
pub trait EngineRouter: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Capability preflight for consuming `producer_id` with `rtp_capabilities`
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    fn closed(&self) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>>;

    async fn close(&self);
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    fn sctp_parameters(&self) -> Option<SctpParameters>;

    fn dtls_state(&self) -> DtlsState;

    fn closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    async fn produce(&self, options: ProducerOptions) -> EngineResult<Arc<dyn EngineProducer>>;

    async fn consume(&self, options: ConsumerOptions) -> EngineResult<Arc<dyn EngineConsumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaType;

    fn rtp_parameters(&self) -> RtpParameters;

    fn paused(&self) -> bool;

    fn closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent>;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn close(&self);
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaType;

    fn rtp_parameters(&self) -> RtpParameters;

    fn paused(&self) -> bool;

    fn producer_paused(&self) -> bool;

    fn closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent>;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn close(&self);
}
