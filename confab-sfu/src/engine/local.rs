//! In-process media engine
//!
//! Keeps the full object graph (workers, routers, transports, producers and
//! consumers) in memory and performs codec negotiation, but forwards no
//! packets. Closing any object cascades to its children exactly once.

use super::{
    ConsumerEvent, ConsumerId, ConsumerOptions, DtlsFingerprint, DtlsParameters, DtlsRole,
    DtlsState, EngineConsumer, EngineError, EngineProducer, EngineResult, EngineRouter,
    EngineTransport, EngineWorker, IceCandidate, IceParameters, MediaEngine, MediaType,
    ProducerEvent, ProducerId, ProducerOptions, Protocol, ResourceUsage, RouterId,
    RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpHeaderExtension, RtpParameters, SctpParameters, TransportEvent,
    TransportId, WebRtcTransportOptions, WorkerSettings,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};
use webrtc::dtls::crypto::Certificate;
use webrtc::ice::rand::{generate_pwd, generate_ufrag};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// First dynamic payload type handed out to router codecs
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

#[derive(Default)]
struct Counters {
    routers: AtomicUsize,
    transports: AtomicUsize,
    producers: AtomicUsize,
    consumers: AtomicUsize,
}

impl Counters {
    fn inc(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn dec(counter: &AtomicUsize) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Engine whose workers live inside the current process
pub struct LocalEngine {
    next_pid: AtomicU32,
    multi_worker: bool,
    workers: Mutex<Vec<Arc<LocalWorker>>>,
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(std::process::id()),
            multi_worker: true,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Engine that only allows one worker per host
    #[must_use]
    pub fn single_worker() -> Self {
        Self {
            multi_worker: false,
            ..Self::new()
        }
    }

    /// Every worker spawned so far, in spawn order
    pub fn workers(&self) -> Vec<Arc<LocalWorker>> {
        self.workers.lock().clone()
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports_multiple_workers(&self) -> bool {
        self.multi_worker
    }

    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn EngineWorker>> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::Spawn(format!(
                "invalid port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let fingerprint = generate_fingerprint()?;
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (died_tx, _) = watch::channel(None);

        let worker = Arc::new(LocalWorker {
            pid,
            started_at: Instant::now(),
            closed: AtomicBool::new(false),
            died_tx,
            routers: DashMap::new(),
            counters: Arc::new(Counters::default()),
            fingerprint,
            ports: Arc::new(PortSource {
                min: settings.rtc_min_port,
                max: settings.rtc_max_port,
                next: AtomicU32::new(0),
            }),
        });
        self.workers.lock().push(Arc::clone(&worker));

        info!(pid, log_level = %settings.log_level, "Local engine worker started");
        Ok(worker)
    }
}

fn generate_fingerprint() -> EngineResult<DtlsFingerprint> {
    let certificate = Certificate::generate_self_signed(vec!["confab".to_owned()])
        .map_err(|e| EngineError::Spawn(format!("certificate generation failed: {e}")))?;
    let der = certificate
        .certificate
        .first()
        .ok_or_else(|| EngineError::Spawn("empty certificate chain".to_string()))?;
    let digest = Sha256::digest(der.as_ref());
    let value = digest
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(":");

    Ok(DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    })
}

pub struct LocalWorker {
    pid: u32,
    started_at: Instant,
    closed: AtomicBool,
    died_tx: watch::Sender<Option<String>>,
    routers: DashMap<RouterId, Arc<LocalRouter>>,
    counters: Arc<Counters>,
    fingerprint: DtlsFingerprint,
    ports: Arc<PortSource>,
}

impl LocalWorker {
    /// Simulate an unexpected worker exit. Everything it hosts is torn down.
    pub fn kill(&self, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = reason.into();
        error!(pid = self.pid, reason = %reason, "Local engine worker died");
        self.close_routers();
        self.died_tx.send_replace(Some(reason));
    }

    /// Simulate a DTLS failure on one transport hosted by this worker
    pub fn fail_transport(&self, transport_id: TransportId) -> bool {
        let transport = self.routers.iter().find_map(|router| {
            router
                .transports
                .get(&transport_id)
                .map(|entry| Arc::clone(entry.value()))
        });
        match transport {
            Some(transport) => {
                transport.fail();
                true
            }
            None => false,
        }
    }

    fn close_routers(&self) {
        let routers: Vec<_> = self.routers.iter().map(|e| Arc::clone(e.value())).collect();
        self.routers.clear();
        for router in routers {
            router.close_inner();
        }
    }
}

#[async_trait]
impl EngineWorker for LocalWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn died(&self) -> watch::Receiver<Option<String>> {
        self.died_tx.subscribe()
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn EngineRouter>> {
        if self.closed() {
            return Err(EngineError::WorkerClosed);
        }
        if media_codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "router needs at least one media codec".to_string(),
            ));
        }

        let router = Arc::new_cyclic(|me| LocalRouter {
            id: RouterId::new(),
            me: me.clone(),
            capabilities: build_router_capabilities(media_codecs),
            closed: AtomicBool::new(false),
            producers: DashMap::new(),
            transports: DashMap::new(),
            counters: Arc::clone(&self.counters),
            fingerprint: self.fingerprint.clone(),
            ports: Arc::clone(&self.ports),
        });

        Counters::inc(&self.counters.routers);
        self.routers.insert(router.id, Arc::clone(&router));
        debug!(pid = self.pid, router_id = %router.id, "Router created");
        Ok(router)
    }

    async fn resource_usage(&self) -> EngineResult<ResourceUsage> {
        if self.closed() {
            return Err(EngineError::WorkerClosed);
        }
        Ok(ResourceUsage {
            routers: self.counters.routers.load(Ordering::Relaxed),
            transports: self.counters.transports.load(Ordering::Relaxed),
            producers: self.counters.producers.load(Ordering::Relaxed),
            consumers: self.counters.consumers.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_routers();
        info!(pid = self.pid, "Local engine worker closed");
    }
}

fn build_router_capabilities(media_codecs: &[RtpCodecCapability]) -> RtpCapabilities {
    let mut used: Vec<u8> = media_codecs
        .iter()
        .filter_map(|codec| codec.preferred_payload_type)
        .collect();
    let mut next = FIRST_DYNAMIC_PAYLOAD_TYPE;

    let codecs = media_codecs
        .iter()
        .map(|codec| {
            let mut codec = codec.clone();
            if codec.preferred_payload_type.is_none() {
                while used.contains(&next) {
                    next = next.saturating_add(1);
                }
                codec.preferred_payload_type = Some(next);
                used.push(next);
            }
            codec
        })
        .collect();

    let extension = |kind, uri: &str, preferred_id| RtpHeaderExtension {
        kind,
        uri: uri.to_string(),
        preferred_id,
    };

    RtpCapabilities {
        codecs,
        header_extensions: vec![
            extension(MediaType::Audio, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
            extension(MediaType::Video, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
            extension(
                MediaType::Video,
                "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
                4,
            ),
            extension(
                MediaType::Video,
                "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
                5,
            ),
            extension(MediaType::Audio, "urn:ietf:params:rtp-hdrext:ssrc-audio-level", 10),
            extension(MediaType::Video, "urn:3gpp:video-orientation", 11),
        ],
    }
}

struct PortSource {
    min: u16,
    max: u16,
    next: AtomicU32,
}

impl PortSource {
    fn allocate(&self) -> u16 {
        let min = u32::from(self.min);
        let span = u32::from(self.max) - min + 1;
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % span;
        u16::try_from(min + offset).unwrap_or(self.min)
    }
}

pub struct LocalRouter {
    id: RouterId,
    me: Weak<LocalRouter>,
    capabilities: RtpCapabilities,
    closed: AtomicBool,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    transports: DashMap<TransportId, Arc<LocalTransport>>,
    counters: Arc<Counters>,
    fingerprint: DtlsFingerprint,
    ports: Arc<PortSource>,
}

impl LocalRouter {
    fn close_inner(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transports: Vec<_> = self
            .transports
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.transports.clear();
        for transport in transports {
            transport.close_inner();
        }
        Counters::dec(&self.counters.routers);
        debug!(router_id = %self.id, "Router closed");
    }

    fn build_candidates(&self, options: &WebRtcTransportOptions) -> Vec<IceCandidate> {
        let mut candidates = Vec::new();
        let mut protocols = Vec::new();
        if options.enable_udp {
            protocols.push(Protocol::Udp);
        }
        if options.enable_tcp {
            protocols.push(Protocol::Tcp);
        }

        for (ip_index, listen_ip) in options.listen_ips.iter().enumerate() {
            let address = listen_ip
                .announced_ip
                .clone()
                .unwrap_or_else(|| listen_ip.ip.clone());
            // Earlier listen ips and the preferred protocol rank higher
            let ip_weight = u32::try_from(options.listen_ips.len() - ip_index).unwrap_or(1);

            for protocol in &protocols {
                let preferred = match protocol {
                    Protocol::Udp => options.prefer_udp,
                    Protocol::Tcp => !options.prefer_udp,
                };
                let priority = ip_weight * 1000 + if preferred { 100 } else { 10 };
                candidates.push(IceCandidate {
                    foundation: match protocol {
                        Protocol::Udp => "udpcandidate".to_string(),
                        Protocol::Tcp => "tcpcandidate".to_string(),
                    },
                    priority,
                    address: address.clone(),
                    protocol: *protocol,
                    port: self.ports.allocate(),
                    candidate_type: "host".to_string(),
                    tcp_type: (*protocol == Protocol::Tcp).then(|| "passive".to_string()),
                });
            }
        }

        candidates
    }
}

#[async_trait]
impl EngineRouter for LocalRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.producers.get(producer_id) else {
            debug!(router_id = %self.id, producer_id = %producer_id, "can_consume: unknown producer");
            return false;
        };
        !producer.closed()
            && producer
                .rtp_parameters
                .codecs
                .iter()
                .any(|codec| rtp_capabilities.find_match(codec).is_some())
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>> {
        if EngineRouter::closed(self) {
            return Err(EngineError::RouterClosed);
        }
        if options.listen_ips.is_empty() {
            return Err(EngineError::InvalidParameters("no listen ips".to_string()));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::InvalidParameters(
                "neither UDP nor TCP enabled".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let sctp_parameters = options.enable_sctp.then(|| SctpParameters {
            port: 5000,
            os: options.num_sctp_streams.os,
            mis: options.num_sctp_streams.mis,
            max_message_size: options.max_sctp_message_size,
        });

        let transport = Arc::new_cyclic(|me| LocalTransport {
            id: TransportId::new(),
            me: me.clone(),
            router: self.me.clone(),
            ice_parameters: IceParameters {
                username_fragment: generate_ufrag(),
                password: generate_pwd(),
                ice_lite: true,
            },
            ice_candidates: self.build_candidates(options),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![self.fingerprint.clone()],
            },
            sctp_parameters,
            dtls_state: Mutex::new(DtlsState::New),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            producers: DashMap::new(),
            consumers: DashMap::new(),
            counters: Arc::clone(&self.counters),
            next_mid: AtomicU32::new(0),
        });

        Counters::inc(&self.counters.transports);
        self.transports.insert(transport.id, Arc::clone(&transport));
        debug!(router_id = %self.id, transport_id = %transport.id, "WebRTC transport created");
        Ok(transport)
    }

    async fn close(&self) {
        self.close_inner();
    }
}

pub struct LocalTransport {
    id: TransportId,
    me: Weak<LocalTransport>,
    router: Weak<LocalRouter>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    sctp_parameters: Option<SctpParameters>,
    dtls_state: Mutex<DtlsState>,
    connected: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    consumers: DashMap<ConsumerId, Arc<LocalConsumer>>,
    counters: Arc<Counters>,
    next_mid: AtomicU32,
}

impl LocalTransport {
    fn set_dtls_state(&self, state: DtlsState) {
        *self.dtls_state.lock() = state;
        let _ = self.events.send(TransportEvent::DtlsStateChanged(state));
    }

    fn fail(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.set_dtls_state(DtlsState::Failed);
        self.close_inner();
    }

    fn close_inner(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let producers: Vec<_> = self.producers.iter().map(|e| Arc::clone(e.value())).collect();
        self.producers.clear();
        for producer in producers {
            producer.close_inner();
        }

        let consumers: Vec<_> = self.consumers.iter().map(|e| Arc::clone(e.value())).collect();
        self.consumers.clear();
        for consumer in consumers {
            consumer.close_with(ConsumerEvent::Closed);
        }

        if let Some(router) = self.router.upgrade() {
            router.transports.remove(&self.id);
        }

        *self.dtls_state.lock() = DtlsState::Closed;
        let _ = self.events.send(TransportEvent::Closed);
        Counters::dec(&self.counters.transports);
        debug!(transport_id = %self.id, "Transport closed");
    }

    fn live_router(&self) -> EngineResult<Arc<LocalRouter>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::TransportClosed);
        }
        self.router
            .upgrade()
            .filter(|router| !router.closed.load(Ordering::Acquire))
            .ok_or(EngineError::RouterClosed)
    }
}

#[async_trait]
impl EngineTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.sctp_parameters
    }

    fn dtls_state(&self) -> DtlsState {
        *self.dtls_state.lock()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()> {
        if EngineTransport::closed(self) {
            return Err(EngineError::TransportClosed);
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "remote DTLS parameters carry no fingerprint".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyConnected);
        }

        self.set_dtls_state(DtlsState::Connecting);
        self.set_dtls_state(DtlsState::Connected);
        debug!(transport_id = %self.id, role = ?dtls_parameters.role, "Transport connected");
        Ok(())
    }

    async fn produce(&self, options: ProducerOptions) -> EngineResult<Arc<dyn EngineProducer>> {
        let router = self.live_router()?;
        let codecs = &options.rtp_parameters.codecs;
        if codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "rtp parameters carry no codecs".to_string(),
            ));
        }
        for codec in codecs {
            let prefix = format!("{}/", options.kind.as_str());
            if !codec.mime_type.to_ascii_lowercase().starts_with(&prefix) {
                return Err(EngineError::InvalidParameters(format!(
                    "codec {} does not match kind {}",
                    codec.mime_type,
                    options.kind.as_str()
                )));
            }
            if router.capabilities.find_match(codec).is_none() {
                return Err(EngineError::Unsupported(format!(
                    "codec {} not supported by router",
                    codec.mime_type
                )));
            }
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let producer = Arc::new(LocalProducer {
            id: ProducerId::new(),
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            paused: AtomicBool::new(options.paused),
            closed: AtomicBool::new(false),
            events,
            consumers: DashMap::new(),
            router: Arc::downgrade(&router),
            transport: self.me.clone(),
            counters: Arc::clone(&self.counters),
        });

        Counters::inc(&self.counters.producers);
        router.producers.insert(producer.id, Arc::clone(&producer));
        self.producers.insert(producer.id, Arc::clone(&producer));
        debug!(
            transport_id = %self.id,
            producer_id = %producer.id,
            kind = options.kind.as_str(),
            "Producer created"
        );
        Ok(producer)
    }

    async fn consume(&self, options: ConsumerOptions) -> EngineResult<Arc<dyn EngineConsumer>> {
        let router = self.live_router()?;
        let producer = router
            .producers
            .get(&options.producer_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::ProducerNotFound(options.producer_id))?;
        if producer.closed.load(Ordering::Acquire) {
            return Err(EngineError::ProducerClosed);
        }

        let codecs: Vec<RtpCodecParameters> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter_map(|codec| {
                options.rtp_capabilities.find_match(codec).map(|cap| RtpCodecParameters {
                    payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                    ..codec.clone()
                })
            })
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::Unsupported(
                "no codec in common with the consuming endpoint".to_string(),
            ));
        }

        let header_extensions = producer
            .rtp_parameters
            .header_extensions
            .iter()
            .filter(|ext| {
                options
                    .rtp_capabilities
                    .header_extensions
                    .iter()
                    .any(|cap| cap.uri == ext.uri)
            })
            .cloned()
            .collect();

        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs,
            header_extensions,
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::random::<u32>()),
                ..RtpEncodingParameters::default()
            }],
            rtcp: RtcpParameters {
                cname: producer.rtp_parameters.rtcp.cname.clone(),
                reduced_size: true,
            },
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::new(),
            producer_id: producer.id,
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(options.paused),
            producer_paused: AtomicBool::new(producer.paused.load(Ordering::Acquire)),
            closed: AtomicBool::new(false),
            events,
            producer: Arc::downgrade(&producer),
            transport: self.me.clone(),
            counters: Arc::clone(&self.counters),
        });

        Counters::inc(&self.counters.consumers);
        producer.consumers.insert(consumer.id, Arc::clone(&consumer));
        self.consumers.insert(consumer.id, Arc::clone(&consumer));
        debug!(
            transport_id = %self.id,
            consumer_id = %consumer.id,
            producer_id = %producer.id,
            paused = options.paused,
            "Consumer created"
        );
        Ok(consumer)
    }

    async fn close(&self) {
        self.close_inner();
    }
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaType,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ProducerEvent>,
    consumers: DashMap<ConsumerId, Arc<LocalConsumer>>,
    router: Weak<LocalRouter>,
    transport: Weak<LocalTransport>,
    counters: Arc<Counters>,
}

impl LocalProducer {
    fn close_inner(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(router) = self.router.upgrade() {
            router.producers.remove(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.producers.remove(&self.id);
        }

        let consumers: Vec<_> = self.consumers.iter().map(|e| Arc::clone(e.value())).collect();
        self.consumers.clear();
        for consumer in consumers {
            consumer.close_with(ConsumerEvent::ProducerClosed);
        }

        let _ = self.events.send(ProducerEvent::Closed);
        Counters::dec(&self.counters.producers);
        debug!(producer_id = %self.id, "Producer closed");
    }

    fn set_paused(&self, paused: bool) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ProducerClosed);
        }
        if self.paused.swap(paused, Ordering::AcqRel) == paused {
            return Ok(());
        }

        let _ = self.events.send(if paused {
            ProducerEvent::Paused
        } else {
            ProducerEvent::Resumed
        });
        for consumer in self.consumers.iter() {
            consumer.set_producer_paused(paused);
        }
        Ok(())
    }
}

#[async_trait]
impl EngineProducer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaType {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.events.subscribe()
    }

    async fn pause(&self) -> EngineResult<()> {
        self.set_paused(true)
    }

    async fn resume(&self) -> EngineResult<()> {
        self.set_paused(false)
    }

    async fn close(&self) {
        self.close_inner();
    }
}

pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaType,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ConsumerEvent>,
    producer: Weak<LocalProducer>,
    transport: Weak<LocalTransport>,
    counters: Arc<Counters>,
}

impl LocalConsumer {
    fn close_with(&self, event: ConsumerEvent) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(producer) = self.producer.upgrade() {
            producer.consumers.remove(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.consumers.remove(&self.id);
        }

        let _ = self.events.send(event);
        Counters::dec(&self.counters.consumers);
        debug!(consumer_id = %self.id, reason = ?event, "Consumer closed");
    }

    fn set_producer_paused(&self, paused: bool) {
        if self.closed.load(Ordering::Acquire)
            || self.producer_paused.swap(paused, Ordering::AcqRel) == paused
        {
            return;
        }
        let _ = self.events.send(if paused {
            ConsumerEvent::ProducerPaused
        } else {
            ConsumerEvent::ProducerResumed
        });
    }

    fn set_paused(&self, paused: bool) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ConsumerClosed);
        }
        if self.paused.swap(paused, Ordering::AcqRel) != paused {
            let _ = self.events.send(if paused {
                ConsumerEvent::Paused
            } else {
                ConsumerEvent::Resumed
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EngineConsumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaType {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::Acquire)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    async fn pause(&self) -> EngineResult<()> {
        self.set_paused(true)
    }

    async fn resume(&self) -> EngineResult<()> {
        self.set_paused(false)
    }

    async fn close(&self) {
        self.close_with(ConsumerEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::audio("audio/opus", 48000, 2),
            RtpCodecCapability::video("video/VP8", 90000),
        ]
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                ..RtpEncodingParameters::default()
            }],
            ..RtpParameters::default()
        }
    }

    async fn router() -> (Arc<dyn EngineWorker>, Arc<dyn EngineRouter>) {
        let engine = LocalEngine::new();
        let worker = engine
            .create_worker(&WorkerSettings::default())
            .await
            .unwrap();
        let router = worker.create_router(&codecs()).await.unwrap();
        (worker, router)
    }

    async fn transport(router: &Arc<dyn EngineRouter>) -> Arc<dyn EngineTransport> {
        router
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .unwrap()
    }

    async fn video_producer(transport: &Arc<dyn EngineTransport>) -> Arc<dyn EngineProducer> {
        transport
            .produce(ProducerOptions {
                kind: MediaType::Video,
                rtp_parameters: vp8_parameters(),
                paused: false,
                app_data: serde_json::Value::Null,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_router_assigns_payload_types() {
        let (_worker, router) = router().await;
        let caps = router.rtp_capabilities();
        assert_eq!(caps.codecs[0].preferred_payload_type, Some(100));
        assert_eq!(caps.codecs[1].preferred_payload_type, Some(101));
    }

    #[tokio::test]
    async fn test_transport_parameters() {
        let (_worker, router) = router().await;
        let transport = transport(&router).await;
        assert!(!transport.ice_parameters().username_fragment.is_empty());
        assert_eq!(transport.ice_candidates().len(), 2);
        assert_eq!(transport.dtls_parameters().fingerprints[0].algorithm, "sha-256");
        assert!(transport.sctp_parameters().is_none());
        assert_eq!(transport.dtls_state(), DtlsState::New);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (_worker, router) = router().await;
        let transport = transport(&router).await;
        let remote = transport.dtls_parameters();
        transport.connect(remote.clone()).await.unwrap();
        assert_eq!(transport.dtls_state(), DtlsState::Connected);
        assert_eq!(
            transport.connect(remote).await.unwrap_err(),
            EngineError::AlreadyConnected
        );
    }

    #[tokio::test]
    async fn test_can_consume_checks_codecs() {
        let (_worker, router) = router().await;
        let send = transport(&router).await;
        let producer = video_producer(&send).await;

        assert!(router.can_consume(&producer.id(), &router.rtp_capabilities()));

        let audio_only = RtpCapabilities {
            codecs: vec![RtpCodecCapability::audio("audio/opus", 48000, 2)],
            header_extensions: Vec::new(),
        };
        assert!(!router.can_consume(&producer.id(), &audio_only));
        assert!(!router.can_consume(&ProducerId::new(), &router.rtp_capabilities()));
    }

    #[tokio::test]
    async fn test_producer_close_closes_consumers() {
        let (_worker, router) = router().await;
        let send = transport(&router).await;
        let recv = transport(&router).await;
        let producer = video_producer(&send).await;

        let consumer = recv
            .consume(ConsumerOptions {
                producer_id: producer.id(),
                rtp_capabilities: router.rtp_capabilities(),
                paused: true,
            })
            .await
            .unwrap();
        assert!(consumer.paused());
        let mut events = consumer.subscribe();

        producer.pause().await.unwrap();
        assert!(consumer.producer_paused());
        assert_eq!(events.recv().await.unwrap(), ConsumerEvent::ProducerPaused);

        producer.close().await;
        assert!(consumer.closed());
        assert_eq!(events.recv().await.unwrap(), ConsumerEvent::ProducerClosed);
        assert!(!router.can_consume(&producer.id(), &router.rtp_capabilities()));
    }

    #[tokio::test]
    async fn test_transport_close_cascades() {
        let (worker, router) = router().await;
        let send = transport(&router).await;
        let producer = video_producer(&send).await;
        let mut events = send.subscribe();

        send.close().await;
        assert!(producer.closed());
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Closed);
        assert!(send
            .produce(ProducerOptions {
                kind: MediaType::Video,
                rtp_parameters: vp8_parameters(),
                paused: false,
                app_data: serde_json::Value::Null,
            })
            .await
            .is_err());

        let usage = worker.resource_usage().await.unwrap();
        assert_eq!(usage.producers, 0);
        assert_eq!(usage.transports, 0);
        assert_eq!(usage.routers, 1);
    }

    #[tokio::test]
    async fn test_produce_rejects_unknown_codec() {
        let (_worker, router) = router().await;
        let send = transport(&router).await;
        let mut parameters = vp8_parameters();
        parameters.codecs[0].mime_type = "video/AV1".to_string();

        let result = send
            .produce(ProducerOptions {
                kind: MediaType::Video,
                rtp_parameters: parameters,
                paused: false,
                app_data: serde_json::Value::Null,
            })
            .await;
        assert!(matches!(result, Err(EngineError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_kill_reports_death() {
        let engine = LocalEngine::new();
        let worker = engine
            .create_worker(&WorkerSettings::default())
            .await
            .unwrap();
        let mut died = worker.died();
        assert!(died.borrow().is_none());

        engine.workers()[0].kill("segfault");
        died.changed().await.unwrap();
        assert_eq!(died.borrow().as_deref(), Some("segfault"));
        assert!(worker.closed());
        assert!(worker.create_router(&codecs()).await.is_err());
    }
}
