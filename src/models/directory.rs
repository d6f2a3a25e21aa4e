//! In-memory directory and room registry adapters
//!
//! Self-contained deployments and the test suite use these; production
//! wires the traits to whatever owns users and rooms.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::{RoomRegistry, UserDirectory};
use crate::types::{RoomId, UserId, UserRecord};

/// User records held in memory
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: RwLock<HashMap<UserId, UserRecord>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: UserRecord) {
        self.users.write().unwrap().insert(record.id, record);
    }

    pub fn len(&self) -> usize {
        self.users.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().unwrap().is_empty()
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn get(&self, user_id: UserId) -> Option<UserRecord> {
        self.users.read().unwrap().get(&user_id).cloned()
    }
}

/// Room registry behavior for deployments without an external room owner
#[derive(Debug)]
pub enum StaticRoomRegistry {
    /// Accept every room id (rooms are created by joining them)
    Open,
    /// Accept only the listed room ids
    Allowlist(RwLock<HashSet<RoomId>>),
}

impl StaticRoomRegistry {
    pub fn open() -> Self {
        Self::Open
    }

    pub fn allowlist(rooms: impl IntoIterator<Item = RoomId>) -> Self {
        Self::Allowlist(RwLock::new(rooms.into_iter().collect()))
    }

    pub fn add(&self, room_id: RoomId) {
        if let Self::Allowlist(rooms) = self {
            rooms.write().unwrap().insert(room_id);
        }
    }
}

#[async_trait]
impl RoomRegistry for StaticRoomRegistry {
    async fn exists(&self, room_id: &RoomId) -> bool {
        match self {
            Self::Open => !room_id.is_empty(),
            Self::Allowlist(rooms) => rooms.read().unwrap().contains(room_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(username: &str) -> UserRecord {
        UserRecord {
            id: Uuid::new_v4(),
            username: username.to_string(),
            full_name: format!("{username} Fullname"),
            speaks_languages: vec!["pt".to_string()],
            understands_languages: vec!["en".to_string()],
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_directory_lookup() {
        let directory = StaticDirectory::new();
        let user = record("ana");
        let id = user.id;
        directory.insert(user);

        let found = directory.get(id).await.unwrap();
        assert_eq!(found.username, "ana");
        assert!(directory.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_open_registry_accepts_everything_nonempty() {
        let registry = StaticRoomRegistry::open();
        assert!(registry.exists(&"standup".to_string()).await);
        assert!(!registry.exists(&String::new()).await);
    }

    #[tokio::test]
    async fn test_allowlist_registry() {
        let registry = StaticRoomRegistry::allowlist(["standup".to_string()]);
        assert!(registry.exists(&"standup".to_string()).await);
        assert!(!registry.exists(&"retro".to_string()).await);
        registry.add("retro".to_string());
        assert!(registry.exists(&"retro".to_string()).await);
    }
}
