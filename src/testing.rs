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

//! Fixtures shared by unit tests: an in-memory connection wired to a real
//! context.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, split, AsyncReadExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::network::{ConnContext, ConnManager, Connection};
use crate::service::{ConnSetup, ServerConfig};

pub(crate) struct TestContext {
    pub ctx: ConnContext,
    pub notify_shutdown: broadcast::Sender<()>,
    pub shutdown_complete_rx: mpsc::Receiver<()>,
}

pub(crate) fn context(setup: ConnSetup, config: ServerConfig) -> TestContext {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
    let ctx = setup.build(
        Arc::new(config),
        Arc::new(ConnManager::new()),
        notify_shutdown.clone(),
        shutdown_complete_tx,
    );
    TestContext {
        ctx,
        notify_shutdown,
        shutdown_complete_rx,
    }
}

/// A connection whose socket is one end of an in-memory pipe; the other end
/// is returned as the peer.
pub(crate) fn duplex_connection(conn_id: u64, ctx: &ConnContext) -> (Arc<Connection>, DuplexStream) {
    let (local, peer) = duplex(64 * 1024);
    let (reader, writer) = split(local);
    (Connection::new(conn_id, reader, writer, None, None, ctx), peer)
}

/// Starts `conn` in the background and waits until it is running.
pub(crate) async fn spawn_start(conn: &Arc<Connection>) -> tokio::task::JoinHandle<()> {
    let runner = conn.clone();
    let handle = tokio::spawn(async move { runner.start().await });
    while conn.state() == crate::network::ConnState::Created {
        tokio::task::yield_now().await;
    }
    handle
}

/// Sleeps in small steps until `done` returns true or `timeout` elapses.
pub(crate) async fn wait_until(timeout: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    done()
}

/// A big-endian `id | len | body` packet.
pub(crate) fn tlv(id: u32, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + body.len());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&(body.len() as u32).to_be_bytes());
    packet.extend_from_slice(body);
    packet
}

pub(crate) async fn read_tlv(peer: &mut DuplexStream) -> (u32, Vec<u8>) {
    let mut head = [0u8; 8];
    peer.read_exact(&mut head).await.unwrap();
    let id = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let len = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;
    let mut body = vec![0; len];
    peer.read_exact(&mut body).await.unwrap();
    (id, body)
}
