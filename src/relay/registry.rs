use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::db::{ConnectionId, UserId};

/// What happens when a user announces from a second connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPolicy {
    /// The newest connection takes over; the older one is unbound and its
    /// disconnect no longer touches the user's presence.
    #[default]
    LastWriterWins,
    /// Every connection stays bound; the user goes offline with the last one.
    MultiSession,
}

/// Result of unbinding a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub user_id: UserId,
    /// Whether the user still has another bound connection.
    pub still_online: bool,
}

/// Result of binding a connection to a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bound {
    /// Other connections of the same user that lost their binding.
    pub displaced: Vec<ConnectionId>,
    /// The user this connection spoke for until now, if it was someone else.
    pub previous: Option<Released>,
}

#[derive(Default)]
struct Bindings {
    open: HashSet<ConnectionId>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, UserId>,
}

impl Bindings {
    fn unbind(&mut self, connection_id: ConnectionId) -> Option<Released> {
        let user_id = self.by_connection.remove(&connection_id)?;
        let still_online = match self.by_user.get_mut(&user_id) {
            Some(connections) => {
                connections.remove(&connection_id);
                !connections.is_empty()
            }
            None => false,
        };
        if !still_online {
            self.by_user.remove(&user_id);
        }
        Some(Released { user_id, still_online })
    }
}

/// Which user each live connection speaks for.
pub struct ConnectionRegistry {
    policy: SessionPolicy,
    bindings: RwLock<Bindings>,
}

impl ConnectionRegistry {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            policy,
            bindings: RwLock::new(Bindings::default()),
        }
    }

    /// Accepts bindings for a freshly connected connection.
    pub async fn open(&self, connection_id: ConnectionId) {
        self.bindings.write().await.open.insert(connection_id);
    }

    /// Binds `connection_id` to `user_id`. Returns `None`, binding nothing,
    /// when the connection was never opened or has been released.
    pub async fn set_online(&self, user_id: UserId, connection_id: ConnectionId) -> Option<Bound> {
        let mut bindings = self.bindings.write().await;
        if !bindings.open.contains(&connection_id) {
            return None;
        }

        let mut bound = Bound::default();
        if bindings.by_connection.get(&connection_id) != Some(&user_id) {
            bound.previous = bindings.unbind(connection_id);
        }

        if self.policy == SessionPolicy::LastWriterWins {
            if let Some(previous) = bindings.by_user.remove(&user_id) {
                for connection in previous {
                    if connection != connection_id {
                        bindings.by_connection.remove(&connection);
                        bound.displaced.push(connection);
                    }
                }
            }
        }

        bindings.by_user.entry(user_id).or_default().insert(connection_id);
        bindings.by_connection.insert(connection_id, user_id);
        Some(bound)
    }

    pub async fn lookup_user_by_connection(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.bindings.read().await.by_connection.get(&connection_id).copied()
    }

    pub async fn connections_of(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.bindings
            .read()
            .await
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn remove(&self, user_id: UserId) {
        let mut bindings = self.bindings.write().await;
        if let Some(connections) = bindings.by_user.remove(&user_id) {
            for connection in connections {
                bindings.by_connection.remove(&connection);
            }
        }
    }

    /// Closes the connection and unbinds it in one step, for disconnects.
    /// A later `set_online` for it is refused.
    pub async fn release(&self, connection_id: ConnectionId) -> Option<Released> {
        let mut bindings = self.bindings.write().await;
        bindings.open.remove(&connection_id);
        bindings.unbind(connection_id)
    }

    /// Number of users with at least one bound connection.
    pub async fn len(&self) -> usize {
        self.bindings.read().await.by_user.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(SessionPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    async fn opened(registry: &ConnectionRegistry) -> ConnectionId {
        let connection_id = Uuid::now_v7();
        registry.open(connection_id).await;
        connection_id
    }

    #[tokio::test]
    async fn last_announce_wins() {
        let registry = ConnectionRegistry::default();
        let (a, b) = (opened(&registry).await, opened(&registry).await);

        assert_eq!(registry.set_online(42, a).await, Some(Bound::default()));
        assert_eq!(registry.set_online(42, b).await.unwrap().displaced, vec![a]);

        assert_eq!(registry.lookup_user_by_connection(a).await, None);
        assert_eq!(registry.lookup_user_by_connection(b).await, Some(42));
        assert_eq!(registry.release(a).await, None);
        assert_eq!(
            registry.release(b).await,
            Some(Released { user_id: 42, still_online: false })
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn switching_user_reports_the_previous_one() {
        let registry = ConnectionRegistry::default();
        let a = opened(&registry).await;

        registry.set_online(1, a).await;
        let bound = registry.set_online(2, a).await.unwrap();

        assert_eq!(bound.previous, Some(Released { user_id: 1, still_online: false }));
        assert_eq!(registry.lookup_user_by_connection(a).await, Some(2));
        assert!(registry.connections_of(1).await.is_empty());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn repeated_announce_is_harmless() {
        let registry = ConnectionRegistry::default();
        let a = opened(&registry).await;

        registry.set_online(1, a).await;
        assert_eq!(registry.set_online(1, a).await, Some(Bound::default()));
        assert_eq!(registry.connections_of(1).await.len(), 1);
    }

    #[tokio::test]
    async fn released_or_unknown_connections_cannot_bind() {
        let registry = ConnectionRegistry::default();
        let a = opened(&registry).await;
        registry.release(a).await;

        assert_eq!(registry.set_online(1, a).await, None);
        assert_eq!(registry.set_online(1, Uuid::now_v7()).await, None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn multi_session_keeps_user_online_until_last_leaves() {
        let registry = ConnectionRegistry::new(SessionPolicy::MultiSession);
        let (a, b) = (opened(&registry).await, opened(&registry).await);

        registry.set_online(7, a).await;
        assert_eq!(registry.set_online(7, b).await, Some(Bound::default()));

        assert_eq!(
            registry.release(a).await,
            Some(Released { user_id: 7, still_online: true })
        );
        assert_eq!(
            registry.release(b).await,
            Some(Released { user_id: 7, still_online: false })
        );
    }

    #[tokio::test]
    async fn remove_drops_every_binding() {
        let registry = ConnectionRegistry::new(SessionPolicy::MultiSession);
        let (a, b) = (opened(&registry).await, opened(&registry).await);
        registry.set_online(7, a).await;
        registry.set_online(7, b).await;

        registry.remove(7).await;
        assert_eq!(registry.lookup_user_by_connection(a).await, None);
        assert_eq!(registry.lookup_user_by_connection(b).await, None);
        assert!(registry.is_empty().await);
    }
}
