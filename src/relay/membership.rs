use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::db::{ChatId, ConnectionId};

#[derive(Default)]
struct Tables {
    rooms: HashMap<ChatId, HashSet<ConnectionId>>,
    /// Open connections and the rooms each one joined. A connection missing
    /// here has left for good and cannot join anything.
    connections: HashMap<ConnectionId, HashSet<ChatId>>,
}

/// Ephemeral chat room membership. Rebuilt from nothing on every start.
#[derive(Default)]
pub struct RoomMembership {
    tables: RwLock<Tables>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, connection_id: ConnectionId) {
        self.tables.write().await.connections.entry(connection_id).or_default();
    }

    /// Set-union insert. Returns `false` when the connection is not open.
    pub async fn join(&self, room_id: ChatId, connection_id: ConnectionId) -> bool {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let Some(joined) = tables.connections.get_mut(&connection_id) else {
            return false;
        };
        joined.insert(room_id);
        tables.rooms.entry(room_id).or_default().insert(connection_id);
        true
    }

    /// Removes the connection from every room and closes it. Returns the rooms it was in.
    pub async fn leave_all(&self, connection_id: ConnectionId) -> Vec<ChatId> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let Some(joined) = tables.connections.remove(&connection_id) else {
            return Vec::new();
        };

        for room_id in &joined {
            if let Some(members) = tables.rooms.get_mut(room_id) {
                members.remove(&connection_id);
                if members.is_empty() {
                    tables.rooms.remove(room_id);
                }
            }
        }
        joined.into_iter().collect()
    }

    pub async fn members_except(&self, room_id: ChatId, connection_id: ConnectionId) -> HashSet<ConnectionId> {
        self.tables
            .read()
            .await
            .rooms
            .get(&room_id)
            .map(|members| members.iter().copied().filter(|c| *c != connection_id).collect())
            .unwrap_or_default()
    }

    pub async fn all_members(&self, room_id: ChatId) -> HashSet<ConnectionId> {
        self.tables.read().await.rooms.get(&room_id).cloned().unwrap_or_default()
    }

    pub async fn rooms_of(&self, connection_id: ConnectionId) -> HashSet<ChatId> {
        self.tables
            .read()
            .await
            .connections
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.tables.read().await.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn join_is_idempotent_and_excludes_self() {
        let membership = RoomMembership::new();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        membership.open(a).await;
        membership.open(b).await;

        for _ in 0..3 {
            assert!(membership.join(7, a).await);
        }
        membership.join(7, b).await;

        assert_eq!(membership.all_members(7).await, HashSet::from([a, b]));
        assert_eq!(membership.members_except(7, a).await, HashSet::from([b]));
        assert!(!membership.members_except(7, b).await.contains(&b));
    }

    #[tokio::test]
    async fn leave_all_clears_every_room() {
        let membership = RoomMembership::new();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        membership.open(a).await;
        membership.open(b).await;
        membership.join(1, a).await;
        membership.join(2, a).await;
        membership.join(2, b).await;

        let mut left = membership.leave_all(a).await;
        left.sort();
        assert_eq!(left, [1, 2]);

        assert!(membership.all_members(1).await.is_empty());
        assert_eq!(membership.all_members(2).await, HashSet::from([b]));
        assert!(membership.rooms_of(a).await.is_empty());
        assert_eq!(membership.room_count().await, 1);
    }

    #[tokio::test]
    async fn join_after_leave_all_is_refused() {
        let membership = RoomMembership::new();
        let a = Uuid::now_v7();
        membership.open(a).await;
        membership.leave_all(a).await;

        assert!(!membership.join(7, a).await);
        assert!(membership.all_members(7).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_joins_commute() {
        let membership = Arc::new(RoomMembership::new());
        let connections: Vec<_> = (0..32).map(|_| Uuid::now_v7()).collect();
        for c in &connections {
            membership.open(*c).await;
        }

        let tasks: Vec<_> = connections
            .iter()
            .map(|c| {
                let membership = membership.clone();
                let c = *c;
                tokio::spawn(async move { membership.join(9, c).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(membership.all_members(9).await.len(), connections.len());
    }
}
