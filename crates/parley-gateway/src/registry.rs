use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_types::events::GatewayEvent;

pub type ConnectionId = Uuid;

/// One open WebSocket channel registered under a user.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl Connection {
    /// Queue an event for this channel. Returns false once the channel's
    /// writer has gone away.
    pub fn send(&self, event: GatewayEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Tracks every open channel, keyed by user. A user may hold several
/// channels at once (one per device).
///
/// Entries are sharded by user key, so connects and disconnects of unrelated
/// users do not contend. Nothing is persisted.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    users: Arc<DashMap<String, HashMap<ConnectionId, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under `user_id` and return its handle.
    pub fn register(
        &self,
        user_id: &str,
        conn_id: ConnectionId,
        tx: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Connection {
        let conn = Connection {
            id: conn_id,
            user_id: user_id.to_string(),
            connected_at: Utc::now(),
            tx,
        };
        self.users
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id, conn.clone());
        conn
    }

    /// Remove a channel. Idempotent; returns whether anything was removed.
    pub fn unregister(&self, conn: &Connection) -> bool {
        let removed = match self.users.get_mut(&conn.user_id) {
            Some(mut channels) => channels.remove(&conn.id).is_some(),
            None => false,
        };
        // Guard above is released before touching the shard again
        self.users.remove_if(&conn.user_id, |_, channels| channels.is_empty());
        removed
    }

    /// Snapshot of the user's open channels; empty when offline.
    pub fn channels_for(&self, user_id: &str) -> Vec<Connection> {
        self.users
            .get(user_id)
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.users.iter().map(|entry| entry.value().len()).sum()
    }
}
