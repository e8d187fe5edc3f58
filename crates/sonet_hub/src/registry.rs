//! The connections table, indexed both ways.
//!
//! Fan-out looks up handles under the shared map, clones the Arcs,
//! releases, and only then enqueues — the table lock is never held while
//! touching a connection queue.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::Connection;

#[derive(Default)]
pub struct ConnectionRegistry {
    by_id: DashMap<String, Arc<Connection>>,
    by_user: DashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.by_id.insert(conn.connection_id.clone(), conn);
    }

    /// Index an authenticated connection under its user.
    pub fn index_user(&self, user_id: &str, connection_id: &str) {
        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.by_id.get(connection_id).map(|e| e.value().clone())
    }

    /// Remove a connection from both indices. Dropping the last Arc closes
    /// the outbound queue, which ends the websocket task's pump.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let removed = self.by_id.remove(connection_id).map(|(_, conn)| conn);
        if let Some(conn) = &removed {
            let user_id = conn.user_id();
            if !user_id.is_empty() {
                if let Some(mut set) = self.by_user.get_mut(&user_id) {
                    set.remove(connection_id);
                    if set.is_empty() {
                        drop(set);
                        self.by_user.remove_if(&user_id, |_, s| s.is_empty());
                    }
                }
            }
        }
        removed
    }

    /// Snapshot of a user's authenticated connections.
    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<String> = match self.by_user.get(user_id) {
            Some(guard) => guard.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.get(id))
            .filter(|c| c.is_authenticated())
            .collect()
    }

    pub fn user_is_online(&self, user_id: &str) -> bool {
        !self.connections_for_user(user_id).is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.by_id.len()
    }

    /// All connections; used by the sweeper for idle eviction.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }
}
