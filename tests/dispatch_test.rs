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
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use stonenet::network::{ConnContext, ConnManager, Connection};
use stonenet::router::{handler, recovery};
use stonenet::utils::OverflowPolicy;
use stonenet::{ConnSetup, ServerConfig};
use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};

type Seen = Arc<Mutex<Vec<(u64, u32)>>>;

fn tlv(id: u32, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + body.len());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&(body.len() as u32).to_be_bytes());
    packet.extend_from_slice(body);
    packet
}

/// Records `(conn_id, sequence)` for every message with id 1.
fn recording_setup(seen: &Seen) -> ConnSetup {
    let seen = seen.clone();
    let mut setup = ConnSetup::new();
    setup.use_handlers([recovery()]);
    setup.add_handler(
        1,
        [handler(move |request| {
            let seen = seen.clone();
            async move {
                let seq = u32::from_be_bytes([
                    request.data()[0],
                    request.data()[1],
                    request.data()[2],
                    request.data()[3],
                ]);
                seen.lock().push((request.conn_id(), seq));
            }
            .boxed()
        })],
    );
    setup
}

fn build(setup: ConnSetup, config: ServerConfig) -> (ConnContext, broadcast::Sender<()>) {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, _) = mpsc::channel(1);
    let ctx = setup.build(
        Arc::new(config),
        Arc::new(ConnManager::new()),
        notify_shutdown.clone(),
        shutdown_complete_tx,
    );
    (ctx, notify_shutdown)
}

fn connect(conn_id: u64, ctx: &ConnContext) -> (Arc<Connection>, DuplexStream) {
    let (local, peer) = duplex(4096);
    let (reader, writer) = split(local);
    let conn = Connection::new(conn_id, reader, writer, None, None, ctx);
    let runner = conn.clone();
    tokio::spawn(async move { runner.start().await });
    (conn, peer)
}

async fn wait_for(seen: &Seen, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while seen.lock().len() < count && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn every_message_is_handled_once_for_its_connection() {
    const CONNECTIONS: u64 = 9000;
    let seen = Seen::default();
    let mut config = ServerConfig::default();
    config.worker_pool.size = 16;
    config.worker_pool.overflow_policy = OverflowPolicy::Block;
    let (ctx, _notify) = build(recording_setup(&seen), config);

    let mut peers = Vec::with_capacity(CONNECTIONS as usize);
    for conn_id in 1..=CONNECTIONS {
        let (conn, mut peer) = connect(conn_id, &ctx);
        peer.write_all(&tlv(1, &(conn_id as u32).to_be_bytes()))
            .await
            .unwrap();
        peers.push((conn, peer));
    }

    wait_for(&seen, CONNECTIONS as usize).await;
    let seen = seen.lock().clone();
    assert_eq!(seen.len(), CONNECTIONS as usize);
    let mut per_conn: HashMap<u64, u32> = HashMap::new();
    for (conn_id, seq) in seen {
        assert_eq!(seq as u64, conn_id, "message attributed to the wrong connection");
        *per_conn.entry(conn_id).or_default() += 1;
    }
    assert_eq!(per_conn.len(), CONNECTIONS as usize);
    assert!(per_conn.values().all(|count| *count == 1));

    assert_eq!(ctx.conn_manager.len(), CONNECTIONS as usize);
    ctx.conn_manager.clear_conn();
    for (conn, _) in &peers {
        assert!(conn.is_closed());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn messages_of_a_connection_keep_arrival_order() {
    const MESSAGES: u32 = 2000;
    let seen = Seen::default();
    let mut config = ServerConfig::default();
    config.worker_pool.size = 4;
    let (ctx, _notify) = build(recording_setup(&seen), config);

    let mut writers = Vec::new();
    let mut conns = Vec::new();
    for conn_id in 1..=4 {
        let (conn, mut peer) = connect(conn_id, &ctx);
        conns.push(conn);
        writers.push(tokio::spawn(async move {
            for seq in 0..MESSAGES {
                peer.write_all(&tlv(1, &seq.to_be_bytes())).await.unwrap();
            }
            peer
        }));
    }
    let mut peers = Vec::new();
    for writer in writers {
        peers.push(writer.await.unwrap());
    }

    wait_for(&seen, 4 * MESSAGES as usize).await;
    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 4 * MESSAGES as usize);
    for conn_id in 1..=4u64 {
        let order: Vec<u32> = seen
            .iter()
            .filter(|(id, _)| *id == conn_id)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(order, (0..MESSAGES).collect::<Vec<_>>());
    }
    for conn in conns {
        conn.stop();
    }
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_worker() {
    let seen = Seen::default();
    let mut setup = recording_setup(&seen);
    setup.add_handler(
        2,
        [handler(|_request| async move { panic!("handler failure") }.boxed())],
    );
    let mut config = ServerConfig::default();
    config.worker_pool.size = 1;
    let (ctx, _notify) = build(setup, config);

    let (conn, mut peer) = connect(1, &ctx);
    let mut stream = tlv(2, b"");
    stream.extend(tlv(1, &7u32.to_be_bytes()));
    peer.write_all(&stream).await.unwrap();

    wait_for(&seen, 1).await;
    assert_eq!(*seen.lock(), vec![(1, 7)]);
    conn.stop();
}
