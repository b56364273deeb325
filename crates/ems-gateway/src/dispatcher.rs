use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use ems_types::events::GatewayEvent;
use ems_types::models::OnlineUser;

/// The live connection currently registered for one identity.
struct ConnectionEntry {
    conn_id: Uuid,
    username: String,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// Connection registry: who is online, and how to reach them.
///
/// Cheap to clone; every clone shares the same registry. There is exactly one
/// entry per user id. Registering again replaces the entry (last write wins),
/// which drops the old sender and ends the superseded connection's send loop.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for gateway events; all connected clients receive all events
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// user_id -> live connection
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to gateway events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a per-user targeted channel. Returns (conn_id, receiver).
    /// Overwrites any existing entry for the same user.
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
        username: String,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.inner.connections.write().await.insert(
            user_id,
            ConnectionEntry {
                conn_id,
                username,
                tx,
            },
        );
        if let Some(old) = previous {
            info!("{} ({}) reconnected, replacing connection {}", old.username, user_id, old.conn_id);
        }
        (conn_id, rx)
    }

    /// Announce that a user is online.
    pub fn user_online(&self, user_id: Uuid, username: String) {
        self.broadcast(GatewayEvent::PresenceUpdate {
            user_id,
            username,
            online: true,
        });
    }

    /// Remove a user's entry, but only if `conn_id` still owns it.
    /// Broadcasts the offline transition and returns true only when an entry
    /// was actually removed.
    pub async fn user_offline(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let removed = {
            let mut connections = self.inner.connections.write().await;
            // Unknown user, or a newer connection has taken over
            let is_current = connections
                .get(&user_id)
                .is_some_and(|entry| entry.conn_id == conn_id);
            if is_current { connections.remove(&user_id) } else { None }
        };

        let Some(entry) = removed else {
            debug!("offline for {} ignored: connection {} is not current", user_id, conn_id);
            return false;
        };

        self.broadcast(GatewayEvent::PresenceUpdate {
            user_id,
            username: entry.username,
            online: false,
        });
        true
    }

    /// Send a targeted event to a specific user. Returns whether a live
    /// connection accepted it.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> bool {
        let connections = self.inner.connections.read().await;
        match connections.get(&user_id) {
            Some(entry) => entry.tx.send(event).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.connections.read().await.contains_key(&user_id)
    }

    /// Snapshot of online users, sorted by username.
    pub async fn online_users(&self) -> Vec<OnlineUser> {
        let mut users: Vec<OnlineUser> = self
            .inner
            .connections
            .read()
            .await
            .iter()
            .map(|(id, entry)| OnlineUser {
                user_id: *id,
                username: entry.username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }
}
