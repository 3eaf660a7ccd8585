//! Session coordinator behavior against the loopback media engine
//!
//! Run with: cargo test -p huddle-server --test session_tests

use async_trait::async_trait;
use huddle_protocol::{
    ConnectionId, ConsumerParameters, DtlsParameters, ErrorKind, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, ServerMessage, TransportDirection, TransportId,
};
use huddle_server::engine::loopback::LoopbackEngine;
use huddle_server::engine::{EngineHealth, MediaCodec, RoutingContext, RoutingEngine};
use huddle_server::error::SessionError;
use huddle_server::session::{ConnectionState, SessionCoordinator, SessionSettings};
use huddle_server::ws::connections::ConnectionManager;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Peer {
    id: ConnectionId,
    events: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Peer {
    /// Everything queued for this peer so far
    fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.events.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn new_producers(&mut self) -> Vec<ProducerId> {
        self.drain()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::NewProducer { producer_id, .. } => Some(producer_id),
                _ => None,
            })
            .collect()
    }

    fn closed_producers(&mut self) -> Vec<ProducerId> {
        self.drain()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::ProducerClosed { producer_id } => Some(producer_id),
                _ => None,
            })
            .collect()
    }
}

struct Harness {
    engine: Arc<LoopbackEngine>,
    coordinator: Arc<SessionCoordinator>,
}

impl Harness {
    fn new() -> Self {
        Self::with_engine(LoopbackEngine::default())
    }

    fn with_engine(engine: LoopbackEngine) -> Self {
        let engine = Arc::new(engine.with_close_tracking());
        let coordinator = SessionCoordinator::start(
            engine.clone(),
            SessionSettings::default(),
            Arc::new(ConnectionManager::new()),
        );
        Self {
            engine,
            coordinator,
        }
    }

    async fn peer(&self) -> Peer {
        let id = ConnectionId::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        self.coordinator.connect(id, tx).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(ServerMessage::Connected { connection_id: id })
        );
        Peer { id, events }
    }

    async fn joined_peer(&self, room: &str) -> Peer {
        let peer = self.peer().await;
        self.coordinator
            .join_room(peer.id, room.to_string(), None)
            .await
            .unwrap();
        peer
    }

    async fn transport(&self, peer: &Peer, direction: TransportDirection) -> TransportId {
        self.coordinator
            .create_transport(peer.id, direction)
            .await
            .unwrap()
            .id
    }

    /// Send transport, connected, with one producer of `kind`
    async fn producing(&self, peer: &Peer, kind: MediaKind) -> ProducerId {
        if self.coordinator.ledger().find_send_transport(peer.id).await.is_err() {
            self.transport(peer, TransportDirection::Send).await;
            self.coordinator
                .connect_transport(peer.id, None, dtls())
                .await
                .unwrap();
        }
        let (producer_id, _) = self
            .coordinator
            .produce(peer.id, kind, RtpParameters(json!({ "encodings": [{ "ssrc": 1111 }] })))
            .await
            .unwrap();
        producer_id
    }

    /// Own receive transport plus a consumer of `producer_id`
    async fn consuming(&self, peer: &Peer, producer_id: ProducerId) -> ConsumerParameters {
        let transport_id = self.transport(peer, TransportDirection::Recv).await;
        self.coordinator
            .connect_recv_transport(peer.id, transport_id, dtls())
            .await
            .unwrap();
        self.coordinator
            .consume(peer.id, producer_id, transport_id, device_capabilities())
            .await
            .unwrap()
    }
}

fn dtls() -> DtlsParameters {
    DtlsParameters(json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }]
    }))
}

fn device_capabilities() -> RtpCapabilities {
    RtpCapabilities(json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ]
    }))
}

/// Let the lifecycle task catch up with engine callbacks
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn concurrent_joins_create_one_router() {
    let harness = Harness::with_engine(
        LoopbackEngine::default().with_router_delay(Duration::from_millis(30)),
    );

    let mut peers = Vec::new();
    for _ in 0..10 {
        peers.push(harness.peer().await);
    }

    let mut joins = Vec::new();
    for peer in &peers {
        let coordinator = harness.coordinator.clone();
        let id = peer.id;
        joins.push(tokio::spawn(async move {
            coordinator.join_room(id, "fresh".to_string(), None).await
        }));
    }

    let mut capabilities = Vec::new();
    for join in joins {
        capabilities.push(join.await.unwrap().unwrap());
    }

    assert_eq!(harness.engine.routers_created(), 1);
    assert!(capabilities.iter().all(|c| *c == capabilities[0]));
    let summary = harness.coordinator.rooms().summary("fresh").await.unwrap();
    assert_eq!(summary.member_count, 10);
}

#[tokio::test]
async fn disconnect_during_join_leaves_no_member_behind() {
    let harness = Harness::with_engine(
        LoopbackEngine::default().with_router_delay(Duration::from_millis(100)),
    );
    let peer = harness.peer().await;

    let coordinator = harness.coordinator.clone();
    let id = peer.id;
    let join = tokio::spawn(async move {
        coordinator.join_room(id, "r1".to_string(), None).await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.coordinator.disconnect(peer.id).await;

    let result = join.await.unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::ProtocolViolation);
    assert_eq!(harness.engine.routers_created(), 1);
    assert!(harness.coordinator.rooms().summaries().await.is_empty());
    assert_eq!(
        harness.coordinator.state_of(peer.id).await,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn disconnect_releases_everything_the_connection_owned() {
    let harness = Harness::new();
    let a = harness.joined_peer("r1").await;
    let b = harness.joined_peer("r1").await;

    let b_producer = harness.producing(&b, MediaKind::Audio).await;

    let audio = harness.producing(&a, MediaKind::Audio).await;
    let video = harness.producing(&a, MediaKind::Video).await;
    let a_send = harness
        .coordinator
        .ledger()
        .find_send_transport(a.id)
        .await
        .unwrap()
        .id;
    let a_consumer = harness.consuming(&a, b_producer).await;
    let consumers = harness
        .coordinator
        .ledger()
        .consumers_of_producer(b_producer)
        .await;
    assert_eq!(consumers, vec![a_consumer.id]);

    let owned = harness.coordinator.ledger().owned_by(a.id).await;
    assert_eq!((owned.transports, owned.producers, owned.consumers), (2, 2, 1));

    harness.coordinator.disconnect(a.id).await;
    settle().await;

    assert!(harness.coordinator.ledger().owned_by(a.id).await.is_empty());
    assert_eq!(
        harness.coordinator.state_of(a.id).await,
        ConnectionState::Disconnected
    );
    for id in [audio.0, video.0, a_send.0, a_consumer.id.0] {
        assert_eq!(harness.engine.close_calls(id), 1, "close count for {}", id);
    }

    // Disconnecting again changes nothing
    harness.coordinator.disconnect(a.id).await;
    settle().await;
    assert_eq!(harness.engine.close_calls(audio.0), 1);
    assert!(harness.coordinator.ledger().find_producer(b_producer).await.is_some());
}

#[tokio::test]
async fn new_producer_reaches_every_other_member_once() {
    let harness = Harness::new();
    let mut members = Vec::new();
    for _ in 0..4 {
        members.push(harness.joined_peer("r1").await);
    }
    let mut outsider = harness.joined_peer("r2").await;

    let producer_id = harness.producing(&members[0], MediaKind::Video).await;

    assert!(members[0].new_producers().is_empty());
    for member in members.iter_mut().skip(1) {
        assert_eq!(member.new_producers(), vec![producer_id]);
    }
    assert!(outsider.new_producers().is_empty());
}

#[tokio::test]
async fn late_joiner_discovers_existing_producers() {
    let harness = Harness::new();
    let a = harness.joined_peer("r1").await;
    let b = harness.joined_peer("r1").await;
    let elsewhere = harness.joined_peer("r2").await;

    let mut expected = HashSet::new();
    expected.insert(harness.producing(&a, MediaKind::Audio).await);
    expected.insert(harness.producing(&a, MediaKind::Video).await);
    expected.insert(harness.producing(&b, MediaKind::Audio).await);
    harness.producing(&elsewhere, MediaKind::Audio).await;

    let mut late = harness.joined_peer("r1").await;
    assert!(late.new_producers().is_empty());

    let listed = harness.coordinator.list_producers(late.id).await.unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(listed.into_iter().collect::<HashSet<_>>(), expected);

    // A producer's owner does not see its own ids
    let own_view = harness.coordinator.list_producers(b.id).await.unwrap();
    assert_eq!(own_view.len(), 2);
}

#[tokio::test]
async fn incompatible_capabilities_create_no_consumer() {
    let harness = Harness::new();
    let a = harness.joined_peer("r1").await;
    let b = harness.joined_peer("r1").await;
    let video = harness.producing(&a, MediaKind::Video).await;
    let transport_id = harness.transport(&b, TransportDirection::Recv).await;

    let audio_only = RtpCapabilities(json!({
        "codecs": [{ "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000 }]
    }));
    let err = harness
        .coordinator
        .consume(b.id, video, transport_id, audio_only)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::CapabilityMismatch(_)));
    assert_eq!(err.kind(), ErrorKind::CapabilityMismatch);
    assert_eq!(harness.coordinator.ledger().counts().await.consumers, 0);
    assert!(harness
        .coordinator
        .ledger()
        .consumers_of_producer(video)
        .await
        .is_empty());
}

#[tokio::test]
async fn closed_producer_takes_its_consumers_along() {
    let harness = Harness::new();
    let a = harness.joined_peer("r1").await;
    let mut viewers = Vec::new();
    for _ in 0..3 {
        viewers.push(harness.joined_peer("r1").await);
    }

    let producer_id = harness.producing(&a, MediaKind::Video).await;
    let mut consumers = Vec::new();
    for viewer in &viewers {
        consumers.push(harness.consuming(viewer, producer_id).await.id);
    }
    for viewer in viewers.iter_mut() {
        viewer.drain();
    }

    assert!(harness.engine.end_producer(producer_id));
    settle().await;

    assert!(harness.coordinator.ledger().find_producer(producer_id).await.is_none());
    assert_eq!(harness.coordinator.ledger().counts().await.consumers, 0);
    for consumer in consumers {
        assert_eq!(harness.engine.close_calls(consumer.0), 1);
    }
    for viewer in viewers.iter_mut() {
        assert_eq!(viewer.closed_producers(), vec![producer_id]);
        // The receive transport carried only this consumer
        assert_eq!(harness.coordinator.ledger().owned_by(viewer.id).await.transports, 0);
    }
}

#[tokio::test]
async fn two_peer_room_walkthrough() {
    let harness = Harness::new();
    let mut a = harness.joined_peer("r1").await;
    let mut b = harness.joined_peer("r1").await;

    assert_eq!(harness.engine.routers_created(), 1);
    let mut members = harness.coordinator.rooms().peers_of("r1", None).await;
    members.sort_by_key(|id| id.0);
    let mut expected = vec![a.id, b.id];
    expected.sort_by_key(|id| id.0);
    assert_eq!(members, expected);

    // Before A produces there is nothing to discover
    assert!(harness.coordinator.list_producers(b.id).await.unwrap().is_empty());

    harness.transport(&a, TransportDirection::Send).await;
    harness
        .coordinator
        .connect_transport(a.id, None, dtls())
        .await
        .unwrap();
    let (pv1, others) = harness
        .coordinator
        .produce(a.id, MediaKind::Video, RtpParameters::default())
        .await
        .unwrap();
    assert!(!others);

    assert_eq!(
        b.drain(),
        vec![ServerMessage::NewProducer {
            producer_id: pv1,
            kind: MediaKind::Video
        }]
    );
    assert!(a.drain().is_empty());
    assert_eq!(
        harness.coordinator.list_producers(b.id).await.unwrap(),
        vec![pv1]
    );

    let consumer = harness.consuming(&b, pv1).await;
    assert_eq!(consumer.producer_id, pv1);
    assert_eq!(consumer.kind, MediaKind::Video);
    assert_eq!(harness.engine.consumer_paused(consumer.id), Some(true));

    harness
        .coordinator
        .resume_consumer(b.id, consumer.id)
        .await
        .unwrap();
    assert_eq!(harness.engine.consumer_paused(consumer.id), Some(false));
}

#[tokio::test]
async fn departing_producer_notifies_its_consumer() {
    let harness = Harness::new();
    let a = harness.joined_peer("r1").await;
    let mut b = harness.joined_peer("r1").await;

    let producer_id = harness.producing(&a, MediaKind::Video).await;
    let consumer = harness.consuming(&b, producer_id).await;
    b.drain();

    harness.coordinator.disconnect(a.id).await;
    settle().await;

    assert!(harness
        .coordinator
        .ledger()
        .find_consumer(b.id, consumer.id)
        .await
        .is_err());
    assert_eq!(b.closed_producers(), vec![producer_id]);
    assert_eq!(harness.engine.close_calls(consumer.id.0), 1);
    assert_eq!(harness.coordinator.rooms().peers_of("r1", None).await, vec![b.id]);
}

#[tokio::test]
async fn other_producers_exist_is_room_scoped_and_ignores_own() {
    let harness = Harness::new();
    let a = harness.joined_peer("r1").await;
    let b = harness.joined_peer("r1").await;
    let c = harness.joined_peer("r2").await;

    harness.producing(&c, MediaKind::Audio).await;

    harness.transport(&a, TransportDirection::Send).await;
    let (_, first) = harness
        .coordinator
        .produce(a.id, MediaKind::Audio, RtpParameters::default())
        .await
        .unwrap();
    let (_, second) = harness
        .coordinator
        .produce(a.id, MediaKind::Video, RtpParameters::default())
        .await
        .unwrap();
    assert!(!first, "producers in another room do not count");
    assert!(!second, "own producers do not count");

    harness.transport(&b, TransportDirection::Send).await;
    let (_, from_b) = harness
        .coordinator
        .produce(b.id, MediaKind::Audio, RtpParameters::default())
        .await
        .unwrap();
    assert!(from_b);
}

#[tokio::test]
async fn requests_before_join_are_protocol_violations() {
    let harness = Harness::new();
    let peer = harness.peer().await;

    assert_eq!(
        harness.coordinator.state_of(peer.id).await,
        ConnectionState::Connected
    );
    let err = harness
        .coordinator
        .create_transport(peer.id, TransportDirection::Send)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

    harness
        .coordinator
        .join_room(peer.id, "r1".to_string(), Some("alice".to_string()))
        .await
        .unwrap();
    assert_eq!(
        harness.coordinator.state_of(peer.id).await,
        ConnectionState::RoomJoined
    );
    let again = harness
        .coordinator
        .join_room(peer.id, "r2".to_string(), None)
        .await
        .unwrap_err();
    assert_eq!(again.kind(), ErrorKind::ProtocolViolation);
}

#[tokio::test]
async fn send_transport_lookups_fail_without_one() {
    let harness = Harness::new();
    let peer = harness.joined_peer("r1").await;

    let err = harness
        .coordinator
        .produce(peer.id, MediaKind::Audio, RtpParameters::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportNotFound);

    let send = harness.transport(&peer, TransportDirection::Send).await;
    let second = harness
        .coordinator
        .create_transport(peer.id, TransportDirection::Send)
        .await
        .unwrap_err();
    assert_eq!(second.kind(), ErrorKind::ProtocolViolation);

    let wrong_id = harness
        .coordinator
        .connect_transport(peer.id, Some(TransportId::new()), dtls())
        .await
        .unwrap_err();
    assert_eq!(wrong_id.kind(), ErrorKind::TransportNotFound);
    harness
        .coordinator
        .connect_transport(peer.id, Some(send), dtls())
        .await
        .unwrap();
}

#[tokio::test]
async fn consume_of_unknown_or_foreign_producer_is_not_found() {
    let harness = Harness::new();
    let a = harness.joined_peer("r1").await;
    let stranger = harness.joined_peer("r2").await;
    let foreign = harness.producing(&stranger, MediaKind::Audio).await;
    let transport_id = harness.transport(&a, TransportDirection::Recv).await;

    for producer_id in [ProducerId::new(), foreign] {
        let err = harness
            .coordinator
            .consume(a.id, producer_id, transport_id, device_capabilities())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
    }

    let err = harness
        .coordinator
        .resume_consumer(a.id, huddle_protocol::ConsumerId::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
}

#[tokio::test]
async fn failed_router_creation_leaves_no_room() {
    let harness = Harness::new();
    harness.engine.fail_router_creation(true);
    let peer = harness.peer().await;

    let err = harness
        .coordinator
        .join_room(peer.id, "r1".to_string(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RoomCreationFailed);
    assert!(harness.coordinator.rooms().summaries().await.is_empty());
    assert_eq!(
        harness.coordinator.state_of(peer.id).await,
        ConnectionState::Connected
    );

    harness.engine.fail_router_creation(false);
    harness
        .coordinator
        .join_room(peer.id, "r1".to_string(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn engine_closed_transport_is_cleaned_up_silently() {
    let harness = Harness::new();
    let mut a = harness.joined_peer("r1").await;
    let mut b = harness.joined_peer("r1").await;

    let producer_id = harness.producing(&a, MediaKind::Audio).await;
    harness.consuming(&b, producer_id).await;
    let a_send = harness
        .coordinator
        .ledger()
        .find_send_transport(a.id)
        .await
        .unwrap()
        .id;
    a.drain();
    b.drain();

    assert!(harness.engine.fail_transport(a_send));
    settle().await;

    assert!(harness.coordinator.ledger().owned_by(a.id).await.is_empty());
    assert!(harness.coordinator.ledger().find_producer(producer_id).await.is_none());
    assert!(a.drain().is_empty());
    assert_eq!(b.closed_producers(), vec![producer_id]);
    assert_eq!(
        harness.coordinator.state_of(a.id).await,
        ConnectionState::RoomJoined
    );

    // The connection may negotiate a new send transport
    harness.transport(&a, TransportDirection::Send).await;
}

#[tokio::test]
async fn last_member_leaving_closes_the_room() {
    let harness = Harness::new();
    let a = harness.joined_peer("r1").await;
    let b = harness.joined_peer("r1").await;

    harness.coordinator.disconnect(a.id).await;
    assert!(harness.coordinator.rooms().summary("r1").await.is_some());
    harness.coordinator.disconnect(b.id).await;
    assert!(harness.coordinator.rooms().summary("r1").await.is_none());

    let c = harness.joined_peer("r1").await;
    assert_eq!(harness.engine.routers_created(), 2);
    harness.coordinator.disconnect(c.id).await;
}

/// Engine whose router creation never completes
struct StalledEngine {
    health: watch::Sender<EngineHealth>,
}

#[async_trait]
impl RoutingEngine for StalledEngine {
    async fn create_router(&self, _codecs: &[MediaCodec]) -> anyhow::Result<Arc<dyn RoutingContext>> {
        std::future::pending().await
    }

    fn health(&self) -> watch::Receiver<EngineHealth> {
        self.health.subscribe()
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_engine_times_out() {
    let (health, _) = watch::channel(EngineHealth::Alive);
    let coordinator = SessionCoordinator::start(
        Arc::new(StalledEngine { health }),
        SessionSettings {
            engine_timeout: Duration::from_millis(200),
            ..SessionSettings::default()
        },
        Arc::new(ConnectionManager::new()),
    );
    let id = ConnectionId::new();
    let (tx, _events) = mpsc::unbounded_channel();
    coordinator.connect(id, tx).await.unwrap();

    let err = coordinator
        .join_room(id, "r1".to_string(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineTimeout);
    assert!(coordinator.rooms().summaries().await.is_empty());
}
