//! In-process routing engine that performs no media I/O.
//!
//! It keeps the same object graph and lifecycle rules as a real engine:
//! closing a transport closes its producers and consumers, closing a producer
//! notifies every consumer of it, and callbacks fire once. The binary uses it
//! for development and the test suites use it to observe engine calls.

use super::{
    ConsumerHandle, EngineHealth, LifecycleCallback, MediaCodec, ProducerHandle, RoutingContext,
    RoutingEngine, TransportConfig, TransportHandle,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use huddle_protocol::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RouterId, RtpCapabilities,
    RtpParameters, TransportId, TransportOptions,
};
use serde_json::json;
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fire(callbacks: &Mutex<Vec<LifecycleCallback>>) {
    let callbacks = mem::take(&mut *lock(callbacks));
    for callback in callbacks {
        callback();
    }
}

/// Port range handed out to transports
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            rtc_min_port: 10000,
            rtc_max_port: 20000,
        }
    }
}

/// State shared by every handle of one engine. The id maps only hold live
/// handles; closing a handle removes its entry.
struct Shared {
    settings: WorkerSettings,
    next_port: AtomicU32,
    track_closes: AtomicBool,
    close_calls: Mutex<HashMap<Uuid, usize>>,
    transports: Mutex<HashMap<TransportId, Weak<LoopbackTransport>>>,
    producers: Mutex<HashMap<ProducerId, Weak<LoopbackProducer>>>,
    consumers: Mutex<HashMap<ConsumerId, Weak<LoopbackConsumer>>>,
}

impl Shared {
    fn record_close(&self, id: Uuid) {
        if !self.track_closes.load(Ordering::Relaxed) {
            return;
        }
        *lock(&self.close_calls).entry(id).or_insert(0) += 1;
    }

    fn allocate_port(&self) -> u16 {
        let min = u32::from(self.settings.rtc_min_port);
        let span = u32::from(self.settings.rtc_max_port).saturating_sub(min) + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        u16::try_from(min + offset).unwrap_or(self.settings.rtc_min_port)
    }
}

pub struct LoopbackEngine {
    shared: Arc<Shared>,
    router_delay: Duration,
    fail_router_creation: AtomicBool,
    routers_created: AtomicUsize,
    health: watch::Sender<EngineHealth>,
}

impl LoopbackEngine {
    pub fn new(settings: WorkerSettings) -> Self {
        let (health, _) = watch::channel(EngineHealth::Alive);
        tracing::info!(
            "Loopback media engine started (ports {}-{})",
            settings.rtc_min_port,
            settings.rtc_max_port
        );

        Self {
            shared: Arc::new(Shared {
                settings,
                next_port: AtomicU32::new(0),
                track_closes: AtomicBool::new(false),
                close_calls: Mutex::new(HashMap::new()),
                transports: Mutex::new(HashMap::new()),
                producers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
            }),
            router_delay: Duration::ZERO,
            fail_router_creation: AtomicBool::new(false),
            routers_created: AtomicUsize::new(0),
            health,
        }
    }

    /// Make router creation suspend, so concurrent joins overlap
    pub fn with_router_delay(mut self, delay: Duration) -> Self {
        self.router_delay = delay;
        self
    }

    /// Count `close()` calls per handle id, see [`LoopbackEngine::close_calls`]
    pub fn with_close_tracking(self) -> Self {
        self.shared.track_closes.store(true, Ordering::Relaxed);
        self
    }

    pub fn fail_router_creation(&self, fail: bool) {
        self.fail_router_creation.store(fail, Ordering::SeqCst);
    }

    /// Number of routers created successfully so far
    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::SeqCst)
    }

    /// How many times `close()` was called on the handle with this id.
    /// Always 0 unless the engine was built `with_close_tracking`.
    pub fn close_calls(&self, id: Uuid) -> usize {
        lock(&self.shared.close_calls).get(&id).copied().unwrap_or(0)
    }

    /// Close a transport from the engine side, as a failed DTLS handshake
    /// would. Returns false if the transport is unknown.
    pub fn fail_transport(&self, id: TransportId) -> bool {
        let transport = lock(&self.shared.transports).get(&id).and_then(Weak::upgrade);
        match transport {
            Some(transport) => {
                tracing::debug!("Loopback transport {} DTLS state closed", id);
                transport.shutdown();
                true
            }
            None => false,
        }
    }

    /// Close a producer from the engine side
    pub fn end_producer(&self, id: ProducerId) -> bool {
        let producer = lock(&self.shared.producers).get(&id).and_then(Weak::upgrade);
        match producer {
            Some(producer) => {
                producer.shutdown();
                true
            }
            None => false,
        }
    }

    /// Whether a consumer is still paused. `None` once it is closed.
    pub fn consumer_paused(&self, id: ConsumerId) -> Option<bool> {
        lock(&self.shared.consumers)
            .get(&id)
            .and_then(Weak::upgrade)
            .map(|c| c.paused.load(Ordering::SeqCst))
    }

    /// Simulate a fatal failure of the engine process
    pub fn kill(&self, reason: &str) {
        tracing::error!("Loopback media engine died: {}", reason);
        self.health.send_replace(EngineHealth::Died(reason.to_string()));
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(WorkerSettings::default())
    }
}

#[async_trait]
impl RoutingEngine for LoopbackEngine {
    async fn create_router(&self, codecs: &[MediaCodec]) -> Result<Arc<dyn RoutingContext>> {
        if !self.router_delay.is_zero() {
            tokio::time::sleep(self.router_delay).await;
        }

        if matches!(*self.health.borrow(), EngineHealth::Died(_)) {
            bail!("media engine is not running");
        }
        if self.fail_router_creation.load(Ordering::SeqCst) {
            bail!("router creation rejected by engine");
        }

        let router = Arc::new_cyclic(|me| LoopbackRouter {
            id: RouterId::new(),
            me: me.clone(),
            codecs: codecs.to_vec(),
            producers: Mutex::new(HashMap::new()),
            shared: self.shared.clone(),
        });
        self.routers_created.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Loopback router {} created", router.id);

        Ok(router)
    }

    fn health(&self) -> watch::Receiver<EngineHealth> {
        self.health.subscribe()
    }
}

pub struct LoopbackRouter {
    id: RouterId,
    me: Weak<LoopbackRouter>,
    codecs: Vec<MediaCodec>,
    producers: Mutex<HashMap<ProducerId, Weak<LoopbackProducer>>>,
    shared: Arc<Shared>,
}

impl LoopbackRouter {
    fn live_producer(&self, producer_id: ProducerId) -> Option<Arc<LoopbackProducer>> {
        lock(&self.producers)
            .get(&producer_id)
            .and_then(Weak::upgrade)
            .filter(|p| !p.closed.load(Ordering::SeqCst))
    }

    fn supports(&self, kind: MediaKind, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|c| c.kind == kind && c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

#[async_trait]
impl RoutingContext for LoopbackRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities(json!({
            "codecs": self.codecs,
            "headerExtensions": [],
        }))
    }

    async fn create_transport(&self, config: &TransportConfig) -> Result<Arc<dyn TransportHandle>> {
        let router = match self.me.upgrade() {
            Some(router) => router,
            None => bail!("router {} is gone", self.id),
        };

        let id = TransportId::new();
        let ip = config
            .announced_ip
            .clone()
            .unwrap_or_else(|| config.listen_ip.clone());
        let port = self.shared.allocate_port();

        let (udp_priority, tcp_priority) = if config.prefer_udp {
            (1076302079u32, 1076276479u32)
        } else {
            (1076276479u32, 1076302079u32)
        };

        let mut candidates = Vec::new();
        if config.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate",
                "ip": ip,
                "port": port,
                "priority": udp_priority,
                "protocol": "udp",
                "type": "host",
            }));
        }
        if config.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "ip": ip,
                "port": port,
                "priority": tcp_priority,
                "protocol": "tcp",
                "tcpType": "passive",
                "type": "host",
            }));
        }
        if candidates.is_empty() {
            bail!("transport config enables neither UDP nor TCP");
        }

        let options = TransportOptions {
            id,
            ice_parameters: json!({
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true,
            }),
            ice_candidates: serde_json::Value::Array(candidates),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": Uuid::new_v4().simple().to_string(),
                }],
            }),
        };

        let transport = Arc::new(LoopbackTransport {
            id,
            options,
            router,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            on_closed: Mutex::new(Vec::new()),
        });
        lock(&self.shared.transports).insert(id, Arc::downgrade(&transport));

        Ok(transport)
    }

    fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool {
        let producer = match self.live_producer(producer_id) {
            Some(producer) => producer,
            None => return false,
        };

        capabilities
            .0
            .get("codecs")
            .and_then(|codecs| codecs.as_array())
            .map(|codecs| {
                codecs.iter().any(|codec| {
                    let kind = codec.get("kind").and_then(|k| k.as_str());
                    let mime = codec.get("mimeType").and_then(|m| m.as_str());
                    kind == Some(producer.kind.as_str())
                        && mime.is_some_and(|m| self.supports(producer.kind, m))
                })
            })
            .unwrap_or(false)
    }
}

pub struct LoopbackTransport {
    id: TransportId,
    options: TransportOptions,
    router: Arc<LoopbackRouter>,
    connected: AtomicBool,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
    on_closed: Mutex<Vec<LifecycleCallback>>,
}

impl LoopbackTransport {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        lock(&self.router.shared.transports).remove(&self.id);

        let producers = mem::take(&mut *lock(&self.producers));
        for producer in producers {
            producer.shutdown();
        }
        let consumers = mem::take(&mut *lock(&self.consumers));
        for consumer in consumers {
            consumer.retire();
        }

        fire(&self.on_closed);
    }
}

#[async_trait]
impl TransportHandle for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn options(&self) -> TransportOptions {
        self.options.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("transport {} is closed", self.id);
        }
        if dtls_parameters.0.is_null() {
            bail!("missing DTLS parameters");
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            bail!("transport {} already connected", self.id);
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn ProducerHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("transport {} is closed", self.id);
        }
        if !self.router.codecs.iter().any(|c| c.kind == kind) {
            bail!("router has no {} codec", kind);
        }

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::new(),
            kind,
            rtp_parameters,
            router: Arc::downgrade(&self.router),
            shared: self.router.shared.clone(),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            on_closed: Mutex::new(Vec::new()),
        });

        lock(&self.router.producers).insert(producer.id, Arc::downgrade(&producer));
        lock(&self.router.shared.producers).insert(producer.id, Arc::downgrade(&producer));
        let mut producers = lock(&self.producers);
        producers.retain(|p| !p.closed.load(Ordering::SeqCst));
        producers.push(producer.clone());
        drop(producers);

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn ConsumerHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("transport {} is closed", self.id);
        }
        if !self.router.can_consume(producer_id, rtp_capabilities) {
            bail!("cannot consume producer {}", producer_id);
        }
        let producer = match self.router.live_producer(producer_id) {
            Some(producer) => producer,
            None => bail!("producer {} not found", producer_id),
        };

        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::new(),
            producer_id,
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            shared: self.router.shared.clone(),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            on_producer_closed: Mutex::new(Vec::new()),
        });

        let mut siblings = lock(&producer.consumers);
        siblings.retain(|c| c.upgrade().is_some_and(|c| !c.closed.load(Ordering::SeqCst)));
        siblings.push(Arc::downgrade(&consumer));
        drop(siblings);

        lock(&self.router.shared.consumers).insert(consumer.id, Arc::downgrade(&consumer));
        let mut consumers = lock(&self.consumers);
        consumers.retain(|c| !c.closed.load(Ordering::SeqCst));
        consumers.push(consumer.clone());
        drop(consumers);

        Ok(consumer)
    }

    fn close(&self) {
        self.router.shared.record_close(self.id.0);
        self.shutdown();
    }

    fn on_closed(&self, callback: LifecycleCallback) {
        if self.closed.load(Ordering::SeqCst) {
            callback();
            return;
        }
        lock(&self.on_closed).push(callback);
    }
}

pub struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router: Weak<LoopbackRouter>,
    shared: Arc<Shared>,
    closed: AtomicBool,
    consumers: Mutex<Vec<Weak<LoopbackConsumer>>>,
    on_closed: Mutex<Vec<LifecycleCallback>>,
}

impl LoopbackProducer {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(router) = self.router.upgrade() {
            lock(&router.producers).remove(&self.id);
        }
        lock(&self.shared.producers).remove(&self.id);

        let consumers = mem::take(&mut *lock(&self.consumers));
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.producer_gone();
        }

        fire(&self.on_closed);
    }
}

impl ProducerHandle for LoopbackProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.shared.record_close(self.id.0);
        self.shutdown();
    }

    fn on_closed(&self, callback: LifecycleCallback) {
        if self.closed.load(Ordering::SeqCst) {
            callback();
            return;
        }
        lock(&self.on_closed).push(callback);
    }
}

pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    shared: Arc<Shared>,
    paused: AtomicBool,
    closed: AtomicBool,
    on_producer_closed: Mutex<Vec<LifecycleCallback>>,
}

impl LoopbackConsumer {
    /// Mark closed and drop the engine's entry. Returns false if it was
    /// already closed.
    fn retire(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        lock(&self.shared.consumers).remove(&self.id);
        true
    }

    fn producer_gone(&self) {
        if self.retire() {
            fire(&self.on_producer_closed);
        }
    }
}

#[async_trait]
impl ConsumerHandle for LoopbackConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("consumer {} is closed", self.id);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.shared.record_close(self.id.0);
        self.retire();
    }

    fn on_producer_closed(&self, callback: LifecycleCallback) {
        lock(&self.on_producer_closed).push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::default_media_codecs;

    fn device_capabilities() -> RtpCapabilities {
        RtpCapabilities(json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
            ]
        }))
    }

    #[tokio::test]
    async fn producer_close_notifies_consumers() {
        let engine = LoopbackEngine::default().with_close_tracking();
        let router = engine.create_router(&default_media_codecs()).await.unwrap();
        let send = router.create_transport(&TransportConfig::default()).await.unwrap();
        let recv = router.create_transport(&TransportConfig::default()).await.unwrap();

        let producer = send
            .produce(MediaKind::Video, RtpParameters::default())
            .await
            .unwrap();
        let consumer = recv
            .consume(producer.id(), &device_capabilities(), true)
            .await
            .unwrap();

        let notified = Arc::new(AtomicBool::new(false));
        let flag = notified.clone();
        consumer.on_producer_closed(Box::new(move || flag.store(true, Ordering::SeqCst)));

        producer.close();
        producer.close();

        assert!(notified.load(Ordering::SeqCst));
        assert_eq!(engine.close_calls(producer.id().0), 2);
        assert!(!router.can_consume(producer.id(), &device_capabilities()));
    }

    #[tokio::test]
    async fn can_consume_requires_matching_codec() {
        let engine = LoopbackEngine::default();
        let router = engine.create_router(&default_media_codecs()).await.unwrap();
        let send = router.create_transport(&TransportConfig::default()).await.unwrap();
        let producer = send
            .produce(MediaKind::Video, RtpParameters::default())
            .await
            .unwrap();

        let audio_only = RtpCapabilities(json!({
            "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }]
        }));
        assert!(!router.can_consume(producer.id(), &audio_only));
        assert!(router.can_consume(producer.id(), &device_capabilities()));
    }

    #[tokio::test]
    async fn transport_close_cascades_to_producers() {
        let engine = LoopbackEngine::default().with_close_tracking();
        let router = engine.create_router(&default_media_codecs()).await.unwrap();
        let send = router.create_transport(&TransportConfig::default()).await.unwrap();
        let producer = send
            .produce(MediaKind::Audio, RtpParameters::default())
            .await
            .unwrap();

        let producer_closed = Arc::new(AtomicBool::new(false));
        let flag = producer_closed.clone();
        producer.on_closed(Box::new(move || flag.store(true, Ordering::SeqCst)));

        send.close();

        assert!(producer_closed.load(Ordering::SeqCst));
        assert_eq!(engine.close_calls(producer.id().0), 0);
        assert!(send
            .produce(MediaKind::Audio, RtpParameters::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn closed_handles_are_forgotten() {
        let engine = LoopbackEngine::default();
        let router = engine.create_router(&default_media_codecs()).await.unwrap();
        let send = router.create_transport(&TransportConfig::default()).await.unwrap();
        let recv = router.create_transport(&TransportConfig::default()).await.unwrap();

        let first = send
            .produce(MediaKind::Video, RtpParameters::default())
            .await
            .unwrap();
        let consumer = recv
            .consume(first.id(), &device_capabilities(), true)
            .await
            .unwrap();

        consumer.close();
        assert_eq!(engine.consumer_paused(consumer.id()), None);
        first.close();
        assert!(!engine.end_producer(first.id()));

        let second = send
            .produce(MediaKind::Video, RtpParameters::default())
            .await
            .unwrap();
        assert!(engine.end_producer(second.id()));
        assert!(!engine.end_producer(second.id()));

        assert!(engine.fail_transport(recv.id()));
        assert!(!engine.fail_transport(recv.id()));
        send.close();
        assert!(!engine.fail_transport(send.id()));

        assert_eq!(engine.close_calls(first.id().0), 0);
        assert!(lock(&engine.shared.transports).is_empty());
        assert!(lock(&engine.shared.producers).is_empty());
        assert!(lock(&engine.shared.consumers).is_empty());
    }

    #[tokio::test]
    async fn router_creation_can_be_failed() {
        let engine = LoopbackEngine::default();
        engine.fail_router_creation(true);
        assert!(engine.create_router(&default_media_codecs()).await.is_err());
        assert_eq!(engine.routers_created(), 0);
    }

    #[tokio::test]
    async fn kill_reports_death() {
        let engine = LoopbackEngine::default();
        let health = engine.health();
        engine.kill("segfault");
        assert_eq!(*health.borrow(), EngineHealth::Died("segfault".to_string()));
    }
}
