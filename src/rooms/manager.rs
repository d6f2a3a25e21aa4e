//! Connection manager
//!
//! Single source of truth for who is connected where. Two maps live under
//! one coarse lock: user -> connection and room -> ordered membership. The
//! lock is never held across an await; message delivery goes through each
//! connection's own outbound queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use super::connection::{CloseReason, Connection, Enqueue};
use crate::metrics::Metrics;
use crate::models::UserDirectory;
use crate::server::protocol::ServerMessage;
use crate::types::{LanguagePair, ParticipantInfo, RoomId, UserId};

/// Rejection reasons for `connect`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// The authenticate step did not produce a user identity
    #[error("authentication required")]
    AuthRequired,
    /// The room is at its participant cap
    #[error("room {0} is full")]
    RoomFull(RoomId),
}

/// What `connect` did besides registering the new connection
#[derive(Debug)]
pub struct ConnectOutcome {
    pub connection: Arc<Connection>,
    /// A previous connection for the same (user, room) was evicted; the
    /// caller must not announce a join/leave pair for a replacement
    pub replaced: bool,
    /// The user moved here from another room, which they implicitly left
    pub left_room: Option<RoomId>,
}

#[derive(Default)]
struct Registry {
    /// One live connection per user
    connections: HashMap<UserId, Arc<Connection>>,
    /// Join-ordered membership per room
    rooms: HashMap<RoomId, Vec<UserId>>,
}

impl Registry {
    fn remove_member(&mut self, room_id: &RoomId, user_id: UserId) {
        let now_empty = match self.rooms.get_mut(room_id) {
            Some(members) => {
                members.retain(|&m| m != user_id);
                members.is_empty()
            }
            None => return,
        };
        if now_empty {
            self.rooms.remove(room_id);
        }
    }
}

/// Registry of live connections and room membership
pub struct ConnectionManager {
    registry: Mutex<Registry>,
    directory: Arc<dyn UserDirectory>,
    metrics: Arc<Metrics>,
    outbound_depth: usize,
    max_participants: usize,
}

impl ConnectionManager {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        metrics: Arc<Metrics>,
        outbound_depth: usize,
        max_participants: usize,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            directory,
            metrics,
            outbound_depth,
            max_participants,
        }
    }

    /// Register an authenticated connection. Any prior connection for the
    /// same user is evicted: same room closes with 4001 and counts as a
    /// replacement, another room closes normally and reads as a leave.
    pub fn connect(
        &self,
        user_id: UserId,
        user_name: String,
        room_id: RoomId,
        languages: LanguagePair,
    ) -> Result<ConnectOutcome, ConnectError> {
        if user_id.is_nil() {
            return Err(ConnectError::AuthRequired);
        }

        let connection = Arc::new(Connection::new(
            user_id,
            room_id.clone(),
            user_name,
            languages,
            self.outbound_depth,
        ));

        let (evicted, replaced, left_room) = {
            let mut registry = self.registry.lock().unwrap();

            let (occupancy, already_member) = registry
                .rooms
                .get(&room_id)
                .map(|members| (members.len(), members.contains(&user_id)))
                .unwrap_or((0, false));
            if !already_member && occupancy >= self.max_participants {
                return Err(ConnectError::RoomFull(room_id));
            }
            if !already_member {
                registry
                    .rooms
                    .entry(room_id.clone())
                    .or_default()
                    .push(user_id);
            }

            let evicted = registry.connections.insert(user_id, connection.clone());
            let (replaced, left_room) = match &evicted {
                Some(old) if old.room_id == room_id => (true, None),
                Some(old) => {
                    let old_room = old.room_id.clone();
                    registry.remove_member(&old_room, user_id);
                    (false, Some(old_room))
                }
                None => (false, None),
            };
            (evicted, replaced, left_room)
        };

        if let Some(old) = evicted {
            let reason = if replaced {
                Metrics::incr(&self.metrics.connections_replaced);
                CloseReason::Replaced
            } else {
                CloseReason::RoomSwitch
            };
            info!(
                "Evicting connection {} for user {} ({})",
                old.id,
                user_id,
                reason.describe()
            );
            old.close(reason);
        }

        Ok(ConnectOutcome {
            connection,
            replaced,
            left_room,
        })
    }

    /// Remove whatever connection the (user, room) pair currently has.
    /// Idempotent; returns the removed connection when there was one.
    pub fn disconnect(
        &self,
        user_id: UserId,
        room_id: &RoomId,
        reason: CloseReason,
    ) -> Option<Arc<Connection>> {
        let removed = {
            let mut registry = self.registry.lock().unwrap();
            let is_current = registry
                .connections
                .get(&user_id)
                .map(|current| &current.room_id == room_id)
                .unwrap_or(false);
            if is_current {
                let conn = registry.connections.remove(&user_id);
                registry.remove_member(room_id, user_id);
                conn
            } else {
                None
            }
        };
        if let Some(conn) = &removed {
            conn.close(reason);
            debug!("Disconnected user {} from room {}", user_id, room_id);
        }
        removed
    }

    /// Identity-guarded removal for a connection's own cleanup path: a
    /// no-op when `conn` was already evicted and something newer holds the
    /// registry slot.
    pub fn disconnect_conn(&self, conn: &Arc<Connection>, reason: CloseReason) -> bool {
        let removed = {
            let mut registry = self.registry.lock().unwrap();
            let is_current = registry
                .connections
                .get(&conn.user_id)
                .map(|current| current.id == conn.id)
                .unwrap_or(false);
            if is_current {
                registry.connections.remove(&conn.user_id);
                registry.remove_member(&conn.room_id, conn.user_id);
            }
            is_current
        };
        conn.close(reason);
        removed
    }

    /// Non-blocking point-to-point delivery. A full queue drops the oldest
    /// message and counts a slow consumer; the caller never waits.
    pub fn send(&self, user_id: UserId, message: ServerMessage) -> bool {
        let conn = {
            let registry = self.registry.lock().unwrap();
            registry.connections.get(&user_id).cloned()
        };
        match conn {
            Some(conn) => match conn.enqueue(message) {
                Enqueue::Queued => true,
                Enqueue::DroppedOldest => {
                    Metrics::incr(&self.metrics.slow_consumer_drops);
                    debug!("Slow consumer {}: dropped oldest outbound", user_id);
                    true
                }
                Enqueue::Closed => false,
            },
            None => false,
        }
    }

    /// Deliver to every member of the room except `exclude`. Per-recipient
    /// failures are swallowed; one stalled listener never affects the rest.
    pub fn broadcast_to_room(
        &self,
        room_id: &RoomId,
        message: &ServerMessage,
        exclude: Option<UserId>,
    ) {
        for user_id in self.get_room_users(room_id) {
            if Some(user_id) == exclude {
                continue;
            }
            self.send(user_id, message.clone());
        }
    }

    /// Snapshot copy of the room's membership in join order
    pub fn get_room_users(&self, room_id: &RoomId) -> Vec<UserId> {
        self.registry
            .lock()
            .unwrap()
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Connection handle for a room member, if currently live
    pub fn get_connection(&self, user_id: UserId) -> Option<Arc<Connection>> {
        self.registry
            .lock()
            .unwrap()
            .connections
            .get(&user_id)
            .cloned()
    }

    /// True when `user_id` is currently a member of `room_id`
    pub fn is_member(&self, room_id: &RoomId, user_id: UserId) -> bool {
        self.registry
            .lock()
            .unwrap()
            .rooms
            .get(room_id)
            .map(|members| members.contains(&user_id))
            .unwrap_or(false)
    }

    /// Roster snapshot with display names resolved via the directory;
    /// members the directory does not know fall back to their connect-time
    /// name.
    pub async fn get_participants_info(&self, room_id: &RoomId) -> Vec<ParticipantInfo> {
        let members: Vec<Arc<Connection>> = {
            let registry = self.registry.lock().unwrap();
            registry
                .rooms
                .get(room_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| registry.connections.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut roster = Vec::with_capacity(members.len());
        for conn in members {
            let info = match self.directory.get(conn.user_id).await {
                Some(record) => {
                    ParticipantInfo::new(record.id, record.username, record.full_name)
                }
                None => ParticipantInfo::new(
                    conn.user_id,
                    conn.user_name.clone(),
                    conn.user_name.clone(),
                ),
            };
            roster.push(info);
        }
        roster
    }

    /// Connections whose last inbound activity is older than `threshold`;
    /// the caller decides what to do with them.
    pub fn idle_connections(&self, threshold: std::time::Duration) -> Vec<Arc<Connection>> {
        self.registry
            .lock()
            .unwrap()
            .connections
            .values()
            .filter(|conn| conn.idle_for() >= threshold)
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().unwrap().connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.registry.lock().unwrap().rooms.len()
    }
}
