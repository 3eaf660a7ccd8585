//! Registry of every live transport, producer and consumer.
//!
//! Entries are keyed by id, with secondary indices by owning connection, by
//! room (producers), by producer (consumers) and by transport. All maps sit
//! under one lock so the indices never disagree with the primary maps.
//! Removal always closes the engine handle before the entry is dropped.

use crate::engine::{ConsumerHandle, ProducerHandle, TransportHandle};
use crate::error::{Result, SessionError};
use huddle_protocol::{
    ConnectionId, ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId,
};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct TransportEntry {
    pub id: TransportId,
    pub owner: ConnectionId,
    pub room: String,
    pub direction: TransportDirection,
    pub handle: Arc<dyn TransportHandle>,
}

#[derive(Clone)]
pub struct ProducerEntry {
    pub id: ProducerId,
    pub owner: ConnectionId,
    pub room: String,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub handle: Arc<dyn ProducerHandle>,
}

#[derive(Clone)]
pub struct ConsumerEntry {
    pub id: ConsumerId,
    pub owner: ConnectionId,
    pub room: String,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub handle: Arc<dyn ConsumerHandle>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

impl LedgerCounts {
    pub fn is_empty(&self) -> bool {
        self.transports == 0 && self.producers == 0 && self.consumers == 0
    }
}

#[derive(Default)]
struct Owned {
    send_transport: Option<TransportId>,
    transports: HashSet<TransportId>,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

impl Owned {
    fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    by_connection: HashMap<ConnectionId, Owned>,
    room_producers: HashMap<String, Vec<ProducerId>>,
    producer_consumers: HashMap<ProducerId, HashSet<ConsumerId>>,
    transport_producers: HashMap<TransportId, HashSet<ProducerId>>,
    transport_consumers: HashMap<TransportId, HashSet<ConsumerId>>,
}

fn unlink<K, V>(index: &mut HashMap<K, HashSet<V>>, key: &K, value: &V)
where
    K: Eq + Hash,
    V: Eq + Hash,
{
    if let Some(set) = index.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

impl Inner {
    fn owned(&mut self, connection_id: ConnectionId) -> &mut Owned {
        self.by_connection.entry(connection_id).or_default()
    }

    fn release_owner(&mut self, connection_id: ConnectionId) {
        if self
            .by_connection
            .get(&connection_id)
            .is_some_and(Owned::is_empty)
        {
            self.by_connection.remove(&connection_id);
        }
    }

    fn take_transport(&mut self, id: TransportId) -> Option<TransportEntry> {
        let entry = self.transports.remove(&id)?;
        if let Some(owned) = self.by_connection.get_mut(&entry.owner) {
            owned.transports.remove(&id);
            if owned.send_transport == Some(id) {
                owned.send_transport = None;
            }
        }
        self.release_owner(entry.owner);
        Some(entry)
    }

    fn take_producer(&mut self, id: ProducerId) -> Option<ProducerEntry> {
        let entry = self.producers.remove(&id)?;
        if let Some(owned) = self.by_connection.get_mut(&entry.owner) {
            owned.producers.remove(&id);
        }
        self.release_owner(entry.owner);
        if let Some(list) = self.room_producers.get_mut(&entry.room) {
            list.retain(|p| *p != id);
            if list.is_empty() {
                self.room_producers.remove(&entry.room);
            }
        }
        unlink(&mut self.transport_producers, &entry.transport_id, &id);
        Some(entry)
    }

    fn take_consumer(&mut self, id: ConsumerId) -> Option<ConsumerEntry> {
        let entry = self.consumers.remove(&id)?;
        if let Some(owned) = self.by_connection.get_mut(&entry.owner) {
            owned.consumers.remove(&id);
        }
        self.release_owner(entry.owner);
        unlink(&mut self.producer_consumers, &entry.producer_id, &id);
        unlink(&mut self.transport_consumers, &entry.transport_id, &id);
        Some(entry)
    }
}

pub struct ResourceLedger {
    inner: RwLock<Inner>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn add_transport(&self, entry: TransportEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.transports.contains_key(&entry.id) {
            return Err(duplicate("transport", entry.id));
        }

        if entry.direction == TransportDirection::Send {
            let existing = inner
                .by_connection
                .get(&entry.owner)
                .and_then(|owned| owned.send_transport);
            if let Some(existing) = existing {
                return Err(SessionError::ProtocolViolation(format!(
                    "connection {} already owns send transport {}",
                    entry.owner, existing
                )));
            }
        }

        let owned = inner.owned(entry.owner);
        if entry.direction == TransportDirection::Send {
            owned.send_transport = Some(entry.id);
        }
        owned.transports.insert(entry.id);

        inner.transports.insert(entry.id, entry);
        Ok(())
    }

    pub async fn add_producer(&self, entry: ProducerEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.producers.contains_key(&entry.id) {
            return Err(duplicate("producer", entry.id));
        }

        inner.owned(entry.owner).producers.insert(entry.id);
        inner
            .room_producers
            .entry(entry.room.clone())
            .or_default()
            .push(entry.id);
        inner
            .transport_producers
            .entry(entry.transport_id)
            .or_default()
            .insert(entry.id);

        inner.producers.insert(entry.id, entry);
        Ok(())
    }

    pub async fn add_consumer(&self, entry: ConsumerEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.consumers.contains_key(&entry.id) {
            return Err(duplicate("consumer", entry.id));
        }

        inner.owned(entry.owner).consumers.insert(entry.id);
        inner
            .producer_consumers
            .entry(entry.producer_id)
            .or_default()
            .insert(entry.id);
        inner
            .transport_consumers
            .entry(entry.transport_id)
            .or_default()
            .insert(entry.id);

        inner.consumers.insert(entry.id, entry);
        Ok(())
    }

    /// The connection's send-side transport
    pub async fn find_send_transport(&self, connection_id: ConnectionId) -> Result<TransportEntry> {
        let inner = self.inner.read().await;
        inner
            .by_connection
            .get(&connection_id)
            .and_then(|owned| owned.send_transport)
            .and_then(|id| inner.transports.get(&id))
            .cloned()
            .ok_or_else(|| {
                SessionError::TransportNotFound(format!(
                    "connection {} has no send transport",
                    connection_id
                ))
            })
    }

    /// A receive-side transport owned by the connection
    pub async fn find_receive_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
    ) -> Result<TransportEntry> {
        self.inner
            .read()
            .await
            .transports
            .get(&transport_id)
            .filter(|t| t.owner == connection_id && t.direction.is_recv())
            .cloned()
            .ok_or_else(|| {
                SessionError::TransportNotFound(format!(
                    "no receive transport {} for connection {}",
                    transport_id, connection_id
                ))
            })
    }

    pub async fn find_producer(&self, producer_id: ProducerId) -> Option<ProducerEntry> {
        self.inner.read().await.producers.get(&producer_id).cloned()
    }

    /// A consumer owned by the connection
    pub async fn find_consumer(
        &self,
        connection_id: ConnectionId,
        consumer_id: ConsumerId,
    ) -> Result<ConsumerEntry> {
        self.inner
            .read()
            .await
            .consumers
            .get(&consumer_id)
            .filter(|c| c.owner == connection_id)
            .cloned()
            .ok_or_else(|| {
                SessionError::ResourceNotFound(format!("consumer {} not found", consumer_id))
            })
    }

    /// Producers in `room` in creation order, leaving out those owned by
    /// `except`
    pub async fn producers_in_room_except(
        &self,
        room: &str,
        except: ConnectionId,
    ) -> Vec<ProducerId> {
        let inner = self.inner.read().await;
        inner
            .room_producers
            .get(room)
            .map(|ids| {
                ids.iter()
                    .filter(|id| inner.producers.get(id).is_some_and(|p| p.owner != except))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn consumers_of_producer(&self, producer_id: ProducerId) -> Vec<ConsumerId> {
        self.inner
            .read()
            .await
            .producer_consumers
            .get(&producer_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn producers_on_transport(&self, transport_id: TransportId) -> Vec<ProducerId> {
        self.inner
            .read()
            .await
            .transport_producers
            .get(&transport_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn consumers_on_transport(&self, transport_id: TransportId) -> Vec<ConsumerId> {
        self.inner
            .read()
            .await
            .transport_consumers
            .get(&transport_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Close and remove one transport. `None` if it was already gone.
    pub async fn remove_transport(&self, id: TransportId) -> Option<TransportEntry> {
        let mut inner = self.inner.write().await;
        inner.transports.get(&id)?.handle.close();
        inner.take_transport(id)
    }

    /// Close and remove one producer. `None` if it was already gone.
    pub async fn remove_producer(&self, id: ProducerId) -> Option<ProducerEntry> {
        let mut inner = self.inner.write().await;
        inner.producers.get(&id)?.handle.close();
        inner.take_producer(id)
    }

    /// Close and remove one consumer. `None` if it was already gone.
    pub async fn remove_consumer(&self, id: ConsumerId) -> Option<ConsumerEntry> {
        let mut inner = self.inner.write().await;
        inner.consumers.get(&id)?.handle.close();
        inner.take_consumer(id)
    }

    pub async fn remove_transports_by_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Vec<TransportEntry> {
        let mut inner = self.inner.write().await;
        let ids: Vec<TransportId> = inner
            .by_connection
            .get(&connection_id)
            .map(|owned| owned.transports.iter().copied().collect())
            .unwrap_or_default();

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = inner.transports.get(&id) {
                entry.handle.close();
            }
            removed.extend(inner.take_transport(id));
        }
        removed
    }

    pub async fn remove_producers_by_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Vec<ProducerEntry> {
        let mut inner = self.inner.write().await;
        let ids: Vec<ProducerId> = inner
            .by_connection
            .get(&connection_id)
            .map(|owned| owned.producers.iter().copied().collect())
            .unwrap_or_default();

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = inner.producers.get(&id) {
                entry.handle.close();
            }
            removed.extend(inner.take_producer(id));
        }
        removed
    }

    pub async fn remove_consumers_by_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Vec<ConsumerEntry> {
        let mut inner = self.inner.write().await;
        let ids: Vec<ConsumerId> = inner
            .by_connection
            .get(&connection_id)
            .map(|owned| owned.consumers.iter().copied().collect())
            .unwrap_or_default();

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = inner.consumers.get(&id) {
                entry.handle.close();
            }
            removed.extend(inner.take_consumer(id));
        }
        removed
    }

    /// Entries owned by one connection
    pub async fn owned_by(&self, connection_id: ConnectionId) -> LedgerCounts {
        self.inner
            .read()
            .await
            .by_connection
            .get(&connection_id)
            .map(|owned| LedgerCounts {
                transports: owned.transports.len(),
                producers: owned.producers.len(),
                consumers: owned.consumers.len(),
            })
            .unwrap_or_default()
    }

    pub async fn counts(&self) -> LedgerCounts {
        let inner = self.inner.read().await;
        LedgerCounts {
            transports: inner.transports.len(),
            producers: inner.producers.len(),
            consumers: inner.consumers.len(),
        }
    }
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn duplicate(kind: &str, id: impl std::fmt::Display) -> SessionError {
    SessionError::ProtocolViolation(format!("{} {} is already registered", kind, id))
}
