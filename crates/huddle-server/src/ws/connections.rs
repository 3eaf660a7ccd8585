use huddle_protocol::{ConnectionId, ServerMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

/// Outbound half of the signaling channel: one queue per live socket
pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(
        &self,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) {
        self.senders.write().await.insert(connection_id, sender);
        tracing::debug!("Signaling channel opened for connection {}", connection_id);
    }

    pub async fn remove_connection(&self, connection_id: ConnectionId) {
        if self.senders.write().await.remove(&connection_id).is_some() {
            tracing::debug!("Signaling channel closed for connection {}", connection_id);
        }
    }

    pub async fn send_to_connection(&self, connection_id: ConnectionId, message: &ServerMessage) {
        let senders = self.senders.read().await;

        if let Some(sender) = senders.get(&connection_id) {
            if let Err(e) = sender.send(message.clone()) {
                tracing::error!("Failed to send message to {}: {}", connection_id, e);
            }
        }
    }

    /// Deliver one event to several connections. Connections that have
    /// already gone away are skipped.
    pub async fn send_to_many(&self, connection_ids: &[ConnectionId], message: &ServerMessage) {
        let senders = self.senders.read().await;

        tracing::debug!("Broadcasting to {} connections", connection_ids.len());
        for conn_id in connection_ids {
            if let Some(sender) = senders.get(conn_id) {
                if let Err(e) = sender.send(message.clone()) {
                    tracing::error!("Failed to send message to {}: {}", conn_id, e);
                }
            }
        }
    }

    pub async fn is_connected(&self, connection_id: ConnectionId) -> bool {
        self.senders.read().await.contains_key(&connection_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::ProducerId;

    #[tokio::test]
    async fn send_to_many_skips_unknown_connections() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let known = ConnectionId::new();
        manager.add_connection(known, tx).await;

        let message = ServerMessage::ProducerClosed {
            producer_id: ProducerId::new(),
        };
        manager
            .send_to_many(&[known, ConnectionId::new()], &message)
            .await;

        assert_eq!(rx.recv().await, Some(message));
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test]
    async fn removed_connections_receive_nothing() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        manager.add_connection(id, tx).await;
        manager.remove_connection(id).await;

        manager.send_to_connection(id, &ServerMessage::Pong).await;
        assert!(!manager.is_connected(id).await);
        assert!(rx.recv().await.is_none());
    }
}
