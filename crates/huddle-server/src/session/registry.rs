use crate::error::{Result, SessionError};
use chrono::{DateTime, Utc};
use huddle_protocol::{ConnectionId, ConsumerId, ProducerId, TransportId};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct PeerDetails {
    pub name: String,
    pub is_admin: bool,
}

/// Per-connection session state
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub room: Option<String>,
    pub transports: Vec<TransportId>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
    pub details: PeerDetails,
    pub connected_at: DateTime<Utc>,
    /// Cancelled when the connection goes away
    pub cancel: CancellationToken,
}

impl Connection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            room: None,
            transports: Vec::new(),
            producers: Vec::new(),
            consumers: Vec::new(),
            details: PeerDetails::default(),
            connected_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Map from connection ID to its session state
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, connection_id: ConnectionId) -> Result<Connection> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&connection_id) {
            return Err(SessionError::ProtocolViolation(format!(
                "connection {} is already registered",
                connection_id
            )));
        }

        let connection = Connection::new(connection_id);
        connections.insert(connection_id, connection.clone());
        tracing::debug!("Registered connection {}", connection_id);

        Ok(connection)
    }

    /// Remove a connection. Absent connections are not an error.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.write().await.remove(&connection_id);
        if removed.is_some() {
            tracing::debug!("Unregistered connection {}", connection_id);
        }
        removed
    }

    pub async fn get(&self, connection_id: ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    pub async fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&connection_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn cancel_token(&self, connection_id: ConnectionId) -> Option<CancellationToken> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|c| c.cancel.clone())
    }

    /// Room the connection has joined, if any
    pub async fn room_of(&self, connection_id: ConnectionId) -> Result<Option<String>> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|c| c.room.clone())
            .ok_or_else(|| unknown(connection_id))
    }

    pub async fn set_room(
        &self,
        connection_id: ConnectionId,
        room: String,
        display_name: Option<String>,
    ) -> Result<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or_else(|| unknown(connection_id))?;

        connection.room = Some(room);
        if let Some(name) = display_name {
            connection.details.name = name;
        }
        Ok(())
    }

    pub async fn record_transport(&self, connection_id: ConnectionId, id: TransportId) {
        self.update(connection_id, |c| c.transports.push(id)).await;
    }

    pub async fn record_producer(&self, connection_id: ConnectionId, id: ProducerId) {
        self.update(connection_id, |c| c.producers.push(id)).await;
    }

    pub async fn record_consumer(&self, connection_id: ConnectionId, id: ConsumerId) {
        self.update(connection_id, |c| c.consumers.push(id)).await;
    }

    pub async fn forget_transport(&self, connection_id: ConnectionId, id: TransportId) {
        self.update(connection_id, |c| c.transports.retain(|t| *t != id))
            .await;
    }

    pub async fn forget_producer(&self, connection_id: ConnectionId, id: ProducerId) {
        self.update(connection_id, |c| c.producers.retain(|p| *p != id))
            .await;
    }

    pub async fn forget_consumer(&self, connection_id: ConnectionId, id: ConsumerId) {
        self.update(connection_id, |c| c.consumers.retain(|p| *p != id))
            .await;
    }

    async fn update(&self, connection_id: ConnectionId, f: impl FnOnce(&mut Connection)) {
        if let Some(connection) = self.connections.write().await.get_mut(&connection_id) {
            f(connection);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(connection_id: ConnectionId) -> SessionError {
    SessionError::ProtocolViolation(format!("connection {} is not registered", connection_id))
}
