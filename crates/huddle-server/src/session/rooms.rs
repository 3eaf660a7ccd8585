use crate::engine::RoutingContext;
use crate::error::Result;
use chrono::{DateTime, Utc};
use huddle_protocol::{ConnectionId, RoomSummary};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Holds the routing context of one room once it has been created.
/// Concurrent first joiners all wait on the same cell.
type ContextCell = Arc<OnceCell<Arc<dyn RoutingContext>>>;

struct RoomEntry {
    context: ContextCell,
    members: Vec<ConnectionId>,
    created_at: DateTime<Utc>,
}

impl RoomEntry {
    fn new(context: ContextCell) -> Self {
        Self {
            context,
            members: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn summary(&self, name: &str) -> RoomSummary {
        RoomSummary {
            name: name.to_string(),
            router_id: self.context.get().map(|c| c.id()),
            member_count: self.members.len(),
            created_at: self.created_at,
        }
    }
}

/// Map from room name to its routing context and members
pub struct RoomDirectory {
    rooms: RwLock<HashMap<String, RoomEntry>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Add `connection_id` to `room`, creating the room's routing context
    /// with `factory` if the room is not active yet.
    ///
    /// At most one `factory` call succeeds per active room; every joiner gets
    /// that same context back.
    pub async fn join_or_create<F, Fut>(
        &self,
        room: &str,
        connection_id: ConnectionId,
        factory: F,
    ) -> Result<Arc<dyn RoutingContext>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Arc<dyn RoutingContext>>>,
    {
        loop {
            let cell = {
                let mut rooms = self.rooms.write().await;
                rooms
                    .entry(room.to_string())
                    .or_insert_with(|| RoomEntry::new(Arc::new(OnceCell::new())))
                    .context
                    .clone()
            };

            let context = match cell.get_or_try_init(&factory).await {
                Ok(context) => context.clone(),
                Err(e) => {
                    self.discard_uninitialized(room, &cell).await;
                    return Err(e);
                }
            };

            let mut rooms = self.rooms.write().await;
            match rooms.entry(room.to_string()) {
                Entry::Occupied(mut occupied) => {
                    // The room emptied and was re-created while we waited;
                    // join the live one instead.
                    if !Arc::ptr_eq(&occupied.get().context, &cell) {
                        continue;
                    }
                    let members = &mut occupied.get_mut().members;
                    if !members.contains(&connection_id) {
                        members.push(connection_id);
                    }
                }
                Entry::Vacant(vacant) => {
                    let mut entry = RoomEntry::new(cell);
                    entry.members.push(connection_id);
                    vacant.insert(entry);
                }
            }

            tracing::debug!(
                "Connection {} joined room {} (router {})",
                connection_id,
                room,
                context.id()
            );
            return Ok(context);
        }
    }

    /// Remove a member. Returns true if this emptied the room, which is then
    /// no longer active.
    pub async fn leave(&self, room: &str, connection_id: ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(entry) = rooms.get_mut(room) else {
            return false;
        };

        entry.members.retain(|m| *m != connection_id);
        if entry.members.is_empty() {
            rooms.remove(room);
            tracing::info!("Room {} is empty and was closed", room);
            return true;
        }
        false
    }

    /// Members of `room`, optionally leaving one out
    pub async fn peers_of(&self, room: &str, except: Option<ConnectionId>) -> Vec<ConnectionId> {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|entry| {
                entry
                    .members
                    .iter()
                    .filter(|m| Some(**m) != except)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn context(&self, room: &str) -> Option<Arc<dyn RoutingContext>> {
        self.rooms
            .read()
            .await
            .get(room)
            .and_then(|entry| entry.context.get().cloned())
    }

    pub async fn summary(&self, room: &str) -> Option<RoomSummary> {
        self.rooms
            .read()
            .await
            .get(room)
            .filter(|entry| !entry.members.is_empty())
            .map(|entry| entry.summary(room))
    }

    /// Active rooms, sorted by name
    pub async fn summaries(&self) -> Vec<RoomSummary> {
        let mut summaries: Vec<RoomSummary> = self
            .rooms
            .read()
            .await
            .iter()
            .filter(|(_, entry)| !entry.members.is_empty())
            .map(|(name, entry)| entry.summary(name))
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Drop a room entry whose context failed to initialize, unless another
    /// joiner still holds its cell and will retry the init.
    async fn discard_uninitialized(&self, room: &str, cell: &ContextCell) {
        let mut rooms = self.rooms.write().await;
        let unused = rooms.get(room).is_some_and(|entry| {
            // One reference in the entry, one held by the caller.
            Arc::ptr_eq(&entry.context, cell)
                && Arc::strong_count(cell) <= 2
                && !entry.context.initialized()
                && entry.members.is_empty()
        });
        if unused {
            rooms.remove(room);
        }
    }
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}
