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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::network::Connection;
use crate::router::{Request, Router};

pub const HEARTBEAT_DEFAULT_MSG_ID: u32 = 99999;

pub type MakeHeartbeatMsg = Arc<dyn Fn(&Connection) -> Bytes + Send + Sync>;
pub type OnRemoteNotAlive = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// User overrides for the heartbeat; every field falls back to a default.
#[derive(Clone, Default)]
pub struct HeartbeatOption {
    /// body of the heartbeat message, defaults to `heartbeat [local->remote]`
    pub make_msg: Option<MakeHeartbeatMsg>,
    /// defaults to stopping the connection
    pub on_remote_not_alive: Option<OnRemoteNotAlive>,
    pub msg_id: Option<u32>,
    /// handles heartbeats from the peer, defaults to logging them
    pub router: Option<Arc<dyn Router>>,
}

impl HeartbeatOption {
    pub fn msg_id(&self) -> u32 {
        self.msg_id.unwrap_or(HEARTBEAT_DEFAULT_MSG_ID)
    }

    pub fn router(&self) -> Arc<dyn Router> {
        self.router
            .clone()
            .unwrap_or_else(|| Arc::new(HeartbeatDefaultRouter))
    }
}

#[derive(Clone)]
pub struct HeartbeatSettings {
    /// time between two checks
    pub interval: Duration,
    /// a peer silent for this long is considered dead
    pub max_idle: Duration,
    pub option: HeartbeatOption,
}

/// Logs heartbeats received from the peer.
#[derive(Debug, Default)]
pub struct HeartbeatDefaultRouter;

#[async_trait]
impl Router for HeartbeatDefaultRouter {
    async fn handle(&self, request: &mut Request) {
        info!(
            conn_id = request.conn_id(),
            remote = ?request.connection().remote_addr(),
            msg_id = request.msg_id(),
            "recv heartbeat: {}",
            String::from_utf8_lossy(request.data())
        );
    }
}

fn default_heartbeat_msg(conn: &Connection) -> Bytes {
    let addr = |addr: Option<SocketAddr>| addr.map_or_else(|| "-".to_string(), |a| a.to_string());
    Bytes::from(format!(
        "heartbeat [{}->{}]",
        addr(conn.local_addr()),
        addr(conn.remote_addr())
    ))
}

fn default_on_remote_not_alive(conn: &Arc<Connection>) {
    info!(
        conn_id = conn.conn_id(),
        remote = ?conn.remote_addr(),
        "remote connection is not alive, stop it"
    );
    conn.stop();
}

/// Periodic liveness check bound to one connection.
///
/// Holds only a weak reference, so a checker never keeps its connection alive.
pub struct HeartbeatChecker {
    conn: Weak<Connection>,
    interval: Duration,
    max_idle: Duration,
    msg_id: u32,
    make_msg: MakeHeartbeatMsg,
    on_remote_not_alive: OnRemoteNotAlive,
    stop: CancellationToken,
    started: AtomicBool,
    fired: Arc<AtomicBool>,
}

impl HeartbeatChecker {
    pub fn new(conn: Weak<Connection>, settings: &HeartbeatSettings) -> Self {
        let option = &settings.option;
        Self {
            conn,
            interval: settings.interval,
            max_idle: settings.max_idle,
            msg_id: option.msg_id(),
            make_msg: option
                .make_msg
                .clone()
                .unwrap_or_else(|| Arc::new(default_heartbeat_msg)),
            on_remote_not_alive: option
                .on_remote_not_alive
                .clone()
                .unwrap_or_else(|| Arc::new(default_on_remote_not_alive)),
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = self.conn.clone();
        let interval = self.interval;
        let max_idle = self.max_idle;
        let msg_id = self.msg_id;
        let make_msg = self.make_msg.clone();
        let on_remote_not_alive = self.on_remote_not_alive.clone();
        let stop = self.stop.clone();
        let fired = self.fired.clone();

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(conn) = conn.upgrade() else {
                    break;
                };
                if conn.is_closed() {
                    break;
                }

                if !conn.is_alive(max_idle) {
                    if !stop.is_cancelled() && !fired.swap(true, Ordering::AcqRel) {
                        on_remote_not_alive(&conn);
                    }
                    break;
                }

                if let Err(err) = conn.send_buffered(msg_id, make_msg(&conn)).await {
                    warn!(conn_id = conn.conn_id(), "send heartbeat failed: {}", err);
                }
            }
            debug!("heartbeat checker exited");
        });
    }

    /// Stops the periodic check. A not-alive callback that has not fired yet
    /// never will.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}
