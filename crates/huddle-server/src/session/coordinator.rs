//! Session state machine and fan-out.
//!
//! Per connection: `Connected` → `RoomJoined` → `Disconnected`. Transports,
//! producers and consumers live in the [`ResourceLedger`], not in the
//! connection state. Engine lifecycle callbacks only enqueue an event; a
//! background task applies it.

use super::ledger::{ConsumerEntry, ProducerEntry, ResourceLedger, TransportEntry};
use super::registry::{Connection, ConnectionRegistry};
use super::rooms::RoomDirectory;
use crate::engine::{with_deadline, EngineCallError, MediaCodec, RoutingEngine, TransportConfig};
use crate::error::{Result, SessionError};
use crate::ws::connections::ConnectionManager;
use huddle_protocol::{
    ClientRequest, ConnectionId, ConsumerId, ConsumerParameters, DtlsParameters, MediaKind,
    ProducerId, Reply, RtpCapabilities, RtpParameters, ServerMessage, TransportDirection,
    TransportId, TransportOptions,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Fixed settings applied to every room and transport
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub media_codecs: Vec<MediaCodec>,
    pub transport: TransportConfig,
    pub engine_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            media_codecs: crate::engine::default_media_codecs(),
            transport: TransportConfig::default(),
            engine_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    RoomJoined,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
enum LifecycleEvent {
    TransportClosed(TransportId),
    ProducerClosed(ProducerId),
    /// The producer behind this consumer went away
    ProducerGone(ConsumerId),
}

pub struct SessionCoordinator {
    engine: Arc<dyn RoutingEngine>,
    settings: SessionSettings,
    registry: ConnectionRegistry,
    rooms: RoomDirectory,
    ledger: ResourceLedger,
    channel: Arc<ConnectionManager>,
    events: mpsc::UnboundedSender<LifecycleEvent>,
}

impl SessionCoordinator {
    /// Build the coordinator and spawn its lifecycle task. Must be called
    /// from within a Tokio runtime.
    pub fn start(
        engine: Arc<dyn RoutingEngine>,
        settings: SessionSettings,
        channel: Arc<ConnectionManager>,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            engine,
            settings,
            registry: ConnectionRegistry::new(),
            rooms: RoomDirectory::new(),
            ledger: ResourceLedger::new(),
            channel,
            events,
        });

        tokio::spawn(run_lifecycle(Arc::downgrade(&coordinator), rx));
        coordinator
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn state_of(&self, connection_id: ConnectionId) -> ConnectionState {
        match self.registry.get(connection_id).await {
            Some(Connection { room: Some(_), .. }) => ConnectionState::RoomJoined,
            Some(_) => ConnectionState::Connected,
            None => ConnectionState::Disconnected,
        }
    }

    /// Register a new connection and the queue its events go to
    pub async fn connect(
        &self,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<Connection> {
        let connection = self.registry.register(connection_id).await?;
        self.channel.add_connection(connection_id, sender).await;
        self.channel
            .send_to_connection(connection_id, &ServerMessage::Connected { connection_id })
            .await;

        tracing::info!("Connection {} established", connection_id);
        Ok(connection)
    }

    /// Run one client request
    pub async fn handle(&self, connection_id: ConnectionId, request: ClientRequest) -> Result<Reply> {
        match request {
            ClientRequest::JoinRoom {
                room_name,
                display_name,
            } => {
                let rtp_capabilities = self
                    .join_room(connection_id, room_name, display_name)
                    .await?;
                Ok(Reply::RoomJoined { rtp_capabilities })
            }
            ClientRequest::CreateTransport { direction } => {
                let params = self.create_transport(connection_id, direction).await?;
                Ok(Reply::TransportCreated { params })
            }
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.connect_transport(connection_id, transport_id, dtls_parameters)
                    .await?;
                Ok(Reply::Ack)
            }
            ClientRequest::Produce {
                kind,
                rtp_parameters,
            } => {
                let (producer_id, other_producers_exist) =
                    self.produce(connection_id, kind, rtp_parameters).await?;
                Ok(Reply::Produced {
                    producer_id,
                    other_producers_exist,
                })
            }
            ClientRequest::ConnectRecvTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.connect_recv_transport(connection_id, transport_id, dtls_parameters)
                    .await?;
                Ok(Reply::Ack)
            }
            ClientRequest::Consume {
                rtp_capabilities,
                producer_id,
                transport_id,
            } => {
                let params = self
                    .consume(connection_id, producer_id, transport_id, rtp_capabilities)
                    .await?;
                Ok(Reply::Consumed { params })
            }
            ClientRequest::ResumeConsumer { consumer_id } => {
                self.resume_consumer(connection_id, consumer_id).await?;
                Ok(Reply::Ack)
            }
            ClientRequest::ListProducers => {
                let producer_ids = self.list_producers(connection_id).await?;
                Ok(Reply::Producers { producer_ids })
            }
            ClientRequest::Ping => Ok(Reply::Ack),
        }
    }

    pub async fn join_room(
        &self,
        connection_id: ConnectionId,
        room_name: String,
        display_name: Option<String>,
    ) -> Result<RtpCapabilities> {
        if room_name.trim().is_empty() {
            return Err(SessionError::ProtocolViolation(
                "room name must not be empty".to_string(),
            ));
        }
        if let Some(current) = self.registry.room_of(connection_id).await? {
            return Err(SessionError::ProtocolViolation(format!(
                "connection is already in room {}",
                current
            )));
        }

        let context = self
            .rooms
            .join_or_create(&room_name, connection_id, || async {
                with_deadline("create_router", self.settings.engine_timeout, || {
                    self.engine.create_router(&self.settings.media_codecs)
                })
                .await
                .map_err(|e| engine_failure(e, SessionError::RoomCreationFailed))
            })
            .await?;

        if !self.registry.contains(connection_id).await {
            self.rooms.leave(&room_name, connection_id).await;
            return Err(gone(connection_id));
        }
        if let Err(e) = self
            .registry
            .set_room(connection_id, room_name.clone(), display_name)
            .await
        {
            self.rooms.leave(&room_name, connection_id).await;
            return Err(e);
        }

        tracing::info!(
            "Connection {} joined room {} (router {})",
            connection_id,
            room_name,
            context.id()
        );
        Ok(context.rtp_capabilities())
    }

    pub async fn create_transport(
        &self,
        connection_id: ConnectionId,
        direction: TransportDirection,
    ) -> Result<TransportOptions> {
        let room = self.require_room(connection_id).await?;
        if direction == TransportDirection::Send
            && self.ledger.find_send_transport(connection_id).await.is_ok()
        {
            return Err(SessionError::ProtocolViolation(
                "connection already has a send transport".to_string(),
            ));
        }
        let context = self
            .rooms
            .context(&room)
            .await
            .ok_or_else(|| SessionError::ResourceNotFound(format!("room {}", room)))?;

        let handle = with_deadline("create_transport", self.settings.engine_timeout, || {
            context.create_transport(&self.settings.transport)
        })
        .await
        .map_err(|e| engine_failure(e, SessionError::TransportCreationFailed))?;

        let transport_id = handle.id();
        if !self.registry.contains(connection_id).await {
            handle.close();
            return Err(gone(connection_id));
        }

        let entry = TransportEntry {
            id: transport_id,
            owner: connection_id,
            room,
            direction,
            handle: handle.clone(),
        };
        if let Err(e) = self.ledger.add_transport(entry).await {
            handle.close();
            return Err(e);
        }
        self.registry
            .record_transport(connection_id, transport_id)
            .await;

        let events = self.events.clone();
        handle.on_closed(Box::new(move || {
            let _ = events.send(LifecycleEvent::TransportClosed(transport_id));
        }));

        tracing::info!(
            "Created {} transport {} for connection {}",
            direction,
            transport_id,
            connection_id
        );
        Ok(handle.options())
    }

    /// Connect the send transport. An explicit id must name that transport.
    pub async fn connect_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: Option<TransportId>,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        self.require_room(connection_id).await?;
        let transport = self.ledger.find_send_transport(connection_id).await?;
        if let Some(requested) = transport_id {
            if requested != transport.id {
                return Err(SessionError::TransportNotFound(format!(
                    "{} is not the send transport of this connection",
                    requested
                )));
            }
        }

        self.connect_handle(&transport, dtls_parameters).await
    }

    pub async fn connect_recv_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        self.require_room(connection_id).await?;
        let transport = self
            .ledger
            .find_receive_transport(connection_id, transport_id)
            .await?;

        self.connect_handle(&transport, dtls_parameters).await
    }

    async fn connect_handle(
        &self,
        transport: &TransportEntry,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        with_deadline("connect_transport", self.settings.engine_timeout, || {
            transport.handle.connect(dtls_parameters.clone())
        })
        .await
        .map_err(|e| {
            engine_failure(e, |message| {
                SessionError::ProtocolViolation(format!("transport connect rejected: {}", message))
            })
        })?;

        tracing::debug!("Transport {} connected", transport.id);
        Ok(())
    }

    /// Start producing on the send transport. Returns the producer id and
    /// whether other peers in the room already produce.
    pub async fn produce(
        &self,
        connection_id: ConnectionId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<(ProducerId, bool)> {
        let room = self.require_room(connection_id).await?;
        let transport = self.ledger.find_send_transport(connection_id).await?;

        let handle = with_deadline("produce", self.settings.engine_timeout, || {
            transport.handle.produce(kind, rtp_parameters.clone())
        })
        .await
        .map_err(|e| engine_failure(e, internal))?;

        let producer_id = handle.id();
        if !self.registry.contains(connection_id).await {
            handle.close();
            return Err(gone(connection_id));
        }

        let entry = ProducerEntry {
            id: producer_id,
            owner: connection_id,
            room: room.clone(),
            transport_id: transport.id,
            kind,
            handle: handle.clone(),
        };
        if let Err(e) = self.ledger.add_producer(entry).await {
            handle.close();
            return Err(e);
        }
        self.registry.record_producer(connection_id, producer_id).await;

        let events = self.events.clone();
        handle.on_closed(Box::new(move || {
            let _ = events.send(LifecycleEvent::ProducerClosed(producer_id));
        }));

        let other_producers_exist = !self
            .ledger
            .producers_in_room_except(&room, connection_id)
            .await
            .is_empty();

        let peers = self.rooms.peers_of(&room, Some(connection_id)).await;
        self.channel
            .send_to_many(&peers, &ServerMessage::NewProducer { producer_id, kind })
            .await;

        tracing::info!(
            "Connection {} produces {} ({}) in room {}, announced to {} peers",
            connection_id,
            producer_id,
            kind,
            room,
            peers.len()
        );
        Ok((producer_id, other_producers_exist))
    }

    /// Producers of the other peers in the caller's room
    pub async fn list_producers(&self, connection_id: ConnectionId) -> Result<Vec<ProducerId>> {
        let room = self.require_room(connection_id).await?;
        Ok(self
            .ledger
            .producers_in_room_except(&room, connection_id)
            .await)
    }

    /// Create a paused consumer of `producer_id` on a receive transport
    pub async fn consume(
        &self,
        connection_id: ConnectionId,
        producer_id: ProducerId,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParameters> {
        let room = self.require_room(connection_id).await?;
        self.ledger
            .find_producer(producer_id)
            .await
            .filter(|p| p.room == room)
            .ok_or_else(|| {
                SessionError::ResourceNotFound(format!("producer {} not found", producer_id))
            })?;
        let transport = self
            .ledger
            .find_receive_transport(connection_id, transport_id)
            .await?;
        let context = self
            .rooms
            .context(&room)
            .await
            .ok_or_else(|| SessionError::ResourceNotFound(format!("room {}", room)))?;

        if !context.can_consume(producer_id, &rtp_capabilities) {
            return Err(SessionError::CapabilityMismatch(producer_id.to_string()));
        }

        let handle = with_deadline("consume", self.settings.engine_timeout, || {
            transport.handle.consume(producer_id, &rtp_capabilities, true)
        })
        .await
        .map_err(|e| engine_failure(e, internal))?;

        let consumer_id = handle.id();
        if !self.registry.contains(connection_id).await {
            handle.close();
            return Err(gone(connection_id));
        }

        let entry = ConsumerEntry {
            id: consumer_id,
            owner: connection_id,
            room,
            transport_id,
            producer_id,
            kind: handle.kind(),
            handle: handle.clone(),
        };
        if let Err(e) = self.ledger.add_consumer(entry).await {
            handle.close();
            return Err(e);
        }
        self.registry.record_consumer(connection_id, consumer_id).await;

        let events = self.events.clone();
        handle.on_producer_closed(Box::new(move || {
            let _ = events.send(LifecycleEvent::ProducerGone(consumer_id));
        }));

        // The producer may have closed while the consumer was being created.
        if self.ledger.find_producer(producer_id).await.is_none() {
            self.reap_consumer(consumer_id, false).await;
            return Err(SessionError::ResourceNotFound(format!(
                "producer {} closed",
                producer_id
            )));
        }

        tracing::info!(
            "Connection {} consumes producer {} as {}",
            connection_id,
            producer_id,
            consumer_id
        );
        Ok(ConsumerParameters {
            id: consumer_id,
            producer_id,
            kind: handle.kind(),
            rtp_parameters: handle.rtp_parameters(),
        })
    }

    pub async fn resume_consumer(
        &self,
        connection_id: ConnectionId,
        consumer_id: ConsumerId,
    ) -> Result<()> {
        let consumer = self.ledger.find_consumer(connection_id, consumer_id).await?;

        with_deadline("resume_consumer", self.settings.engine_timeout, || {
            consumer.handle.resume()
        })
        .await
        .map_err(|e| engine_failure(e, internal))?;

        tracing::debug!("Consumer {} resumed", consumer_id);
        Ok(())
    }

    /// Tear down everything the connection owns. Safe to call more than once.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some(cancel) = self.registry.cancel_token(connection_id).await else {
            self.channel.remove_connection(connection_id).await;
            return;
        };
        cancel.cancel();

        let consumers = self
            .ledger
            .remove_consumers_by_connection(connection_id)
            .await;

        let producers = self
            .ledger
            .remove_producers_by_connection(connection_id)
            .await;
        for producer in &producers {
            self.propagate_producer_closed(producer.id).await;
        }

        let transports = self
            .ledger
            .remove_transports_by_connection(connection_id)
            .await;

        if let Ok(Some(room)) = self.registry.room_of(connection_id).await {
            self.rooms.leave(&room, connection_id).await;
        }
        self.registry.unregister(connection_id).await;
        self.channel.remove_connection(connection_id).await;

        tracing::info!(
            "Connection {} disconnected: closed {} consumers, {} producers, {} transports",
            connection_id,
            consumers.len(),
            producers.len(),
            transports.len()
        );
    }

    async fn require_room(&self, connection_id: ConnectionId) -> Result<String> {
        self.registry.room_of(connection_id).await?.ok_or_else(|| {
            SessionError::ProtocolViolation("join a room first".to_string())
        })
    }

    /// Close every consumer of a producer that has just closed and tell
    /// their owners.
    async fn propagate_producer_closed(&self, producer_id: ProducerId) {
        for consumer_id in self.ledger.consumers_of_producer(producer_id).await {
            self.reap_consumer(consumer_id, true).await;
        }
    }

    /// Close and remove one consumer. Its receive transport goes with it
    /// once no other consumer uses that transport.
    async fn reap_consumer(&self, consumer_id: ConsumerId, notify: bool) {
        let Some(consumer) = self.ledger.remove_consumer(consumer_id).await else {
            return;
        };
        self.registry
            .forget_consumer(consumer.owner, consumer_id)
            .await;

        if notify {
            self.channel
                .send_to_connection(
                    consumer.owner,
                    &ServerMessage::ProducerClosed {
                        producer_id: consumer.producer_id,
                    },
                )
                .await;
        }

        if self
            .ledger
            .consumers_on_transport(consumer.transport_id)
            .await
            .is_empty()
        {
            if let Some(transport) = self.ledger.remove_transport(consumer.transport_id).await {
                self.registry
                    .forget_transport(transport.owner, transport.id)
                    .await;
            }
        }

        tracing::debug!(
            "Consumer {} of producer {} closed",
            consumer_id,
            consumer.producer_id
        );
    }

    async fn close_producer(&self, producer_id: ProducerId) {
        if let Some(producer) = self.ledger.remove_producer(producer_id).await {
            self.registry
                .forget_producer(producer.owner, producer_id)
                .await;
            self.propagate_producer_closed(producer_id).await;
        }
    }

    /// Same cleanup as an explicit close, without any error to the owner
    async fn teardown_transport(&self, transport_id: TransportId) {
        for consumer_id in self.ledger.consumers_on_transport(transport_id).await {
            self.reap_consumer(consumer_id, false).await;
        }
        for producer_id in self.ledger.producers_on_transport(transport_id).await {
            self.close_producer(producer_id).await;
        }
        if let Some(transport) = self.ledger.remove_transport(transport_id).await {
            self.registry
                .forget_transport(transport.owner, transport_id)
                .await;
            tracing::info!(
                "Transport {} of connection {} closed by the engine",
                transport_id,
                transport.owner
            );
        }
    }

    async fn on_lifecycle(&self, event: LifecycleEvent) {
        tracing::debug!("Lifecycle event {:?}", event);
        match event {
            LifecycleEvent::TransportClosed(transport_id) => {
                self.teardown_transport(transport_id).await
            }
            LifecycleEvent::ProducerClosed(producer_id) => self.close_producer(producer_id).await,
            LifecycleEvent::ProducerGone(consumer_id) => {
                self.reap_consumer(consumer_id, true).await
            }
        }
    }
}

async fn run_lifecycle(
    coordinator: Weak<SessionCoordinator>,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        coordinator.on_lifecycle(event).await;
    }
    tracing::debug!("Lifecycle task stopped");
}

fn engine_failure(err: EngineCallError, wrap: impl FnOnce(String) -> SessionError) -> SessionError {
    match err {
        EngineCallError::TimedOut(operation) => SessionError::EngineTimeout(operation),
        EngineCallError::Failed(e) => {
            tracing::warn!("Engine call failed: {:?}", e);
            wrap(e.to_string())
        }
    }
}

fn internal(message: String) -> SessionError {
    SessionError::Internal(anyhow::anyhow!(message))
}

fn gone(connection_id: ConnectionId) -> SessionError {
    SessionError::ProtocolViolation(format!("connection {} has disconnected", connection_id))
}
