// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::network::Connection;

/// Registry of live connections, read-mostly.
#[derive(Debug, Default)]
pub struct ConnManager {
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
}

impl ConnManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Connection>) {
        let conn_id = conn.conn_id();
        let count = {
            let mut connections = self.connections.write();
            connections.insert(conn_id, conn);
            connections.len()
        };
        debug!(conn_id, count, "connection added to manager");
    }

    pub fn remove(&self, conn: &Connection) {
        let conn_id = conn.conn_id();
        let count = {
            let mut connections = self.connections.write();
            connections.remove(&conn_id);
            connections.len()
        };
        debug!(conn_id, count, "connection removed from manager");
    }

    pub fn get(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.connections.read().get(&conn_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn all_conn_ids(&self) -> Vec<u64> {
        self.connections.read().keys().copied().collect()
    }

    /// Stops and unregisters every connection.
    pub fn clear_conn(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.write();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            conn.stop();
        }
        debug!(count = drained.len(), "all connections cleared");
    }

    /// Stops and unregisters one connection. Returns false if it was not
    /// registered.
    pub fn clear_one_conn(&self, conn_id: u64) -> bool {
        let removed = self.connections.write().remove(&conn_id);
        match removed {
            Some(conn) => {
                conn.stop();
                debug!(conn_id, "connection cleared");
                true
            }
            None => {
                warn!(conn_id, "clear connection: not found");
                false
            }
        }
    }

    /// Queues the message on every live connection and returns how many
    /// accepted it.
    pub async fn broadcast(&self, msg_id: u32, data: Bytes) -> usize {
        let snapshot: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        let mut delivered = 0;
        for conn in snapshot {
            match conn.send_buffered(msg_id, data.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => warn!(conn_id = conn.conn_id(), msg_id, "broadcast failed: {}", err),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ConnSetup, ServerConfig};
    use crate::testing::{context, duplex_connection, read_tlv, spawn_start};

    #[tokio::test]
    async fn tracks_started_connections() {
        let env = context(ConnSetup::new(), ServerConfig::default());
        let manager = env.ctx.conn_manager.clone();
        let mut peers = Vec::new();
        let mut handles = Vec::new();
        for id in 1..=3 {
            let (conn, peer) = duplex_connection(id, &env.ctx);
            handles.push(spawn_start(&conn).await);
            peers.push(peer);
        }

        assert_eq!(manager.len(), 3);
        let mut ids = manager.all_conn_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(manager.broadcast(9, Bytes::from_static(b"all")).await, 3);
        for peer in &mut peers {
            assert_eq!(read_tlv(peer).await, (9, b"all".to_vec()));
        }

        assert!(manager.clear_one_conn(2));
        assert!(!manager.clear_one_conn(2));
        assert!(manager.get(2).is_none());
        assert_eq!(manager.len(), 2);

        manager.clear_conn();
        assert!(manager.is_empty());
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(manager.is_empty());
    }
}
