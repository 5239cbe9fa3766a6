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

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{ConnContext, ConnManager};
use crate::service::handshake::Handshake;
use crate::service::{ConnSetup, ServerConfig};
use crate::{AppError, AppResult, Shutdown};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// A TCP server: accepts connections and runs one
/// [`Connection`](crate::network::Connection) actor for each until shutdown.
///
/// With a certificate configured every connection is TLS. With websocket
/// enabled, peers that open with an HTTP upgrade are served over websocket on
/// the same port.
pub struct Server {
    config: Arc<ServerConfig>,
    setup: ConnSetup,
    conn_manager: Arc<ConnManager>,
}

impl Server {
    pub fn new(config: ServerConfig, setup: ConnSetup) -> Self {
        Server {
            config: Arc::new(config),
            setup,
            conn_manager: Arc::new(ConnManager::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn setup_mut(&mut self) -> &mut ConnSetup {
        &mut self.setup
    }

    pub fn conn_manager(&self) -> Arc<ConnManager> {
        self.conn_manager.clone()
    }

    /// Binds the configured address and serves until ctrl-c.
    pub async fn serve(self) -> AppResult<()> {
        let listen_address = self.config.network.bind_addr();
        let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, err
            );
            error!(error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        info!(
            "{} binding to {} for listening",
            self.config.general.name, &listen_address
        );
        self.run(listener, async {
            if let Err(err) = signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", err);
            }
        })
        .await
    }

    /// Serves connections from `listener` until `shutdown` completes.
    ///
    // Graceful shutdown sequence:
    // 1. The accept loop is dropped once `shutdown` resolves, so no new connection is taken.
    // 2. Every live connection is stopped. A connection task that has not registered with
    //    the manager yet sees the shutdown broadcast instead.
    // 3. Workers exit on the same broadcast, after finishing the task they are running.
    // 4. Connection tasks and workers each hold a `shutdown_complete_tx`; once all of them
    //    are dropped the final `recv` returns and the server exits.
    pub async fn run(self, listener: TcpListener, shutdown: impl Future) -> AppResult<()> {
        let handshake = Handshake::from_config(&self.config.network)?;
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

        let ctx = self.setup.build(
            self.config.clone(),
            self.conn_manager.clone(),
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );
        let acceptor = Acceptor {
            listener,
            limit_connections: Arc::new(Semaphore::new(self.config.network.max_connection)),
            max_connection: self.config.network.max_connection,
            notify_shutdown: notify_shutdown.clone(),
            shutdown_complete_tx,
            handshake,
            ctx,
        };

        tokio::select! {
            res = acceptor.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept");
                }
            }
            _ = shutdown => {
                info!("get shutdown signal");
            }
        }

        drop(acceptor);
        self.conn_manager.clear_conn();
        // no receiver means nothing is left to notify
        let _ = notify_shutdown.send(());
        drop(notify_shutdown);

        debug!("waiting for shutdown complete...");
        let _ = shutdown_complete_rx.recv().await;
        info!("{} shutdown complete", self.config.general.name);
        Ok(())
    }
}

struct Acceptor {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    max_connection: usize,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    handshake: Handshake,
    ctx: ConnContext,
}

impl Acceptor {
    async fn run(&self) -> AppResult<()> {
        loop {
            let socket = self.accept().await;

            let Ok(permit) = self.limit_connections.clone().try_acquire_owned() else {
                warn!(
                    remote = ?socket.peer_addr().ok(),
                    "refuse connection: {}",
                    AppError::MaxConnectionsReached(self.max_connection)
                );
                drop(socket);
                continue;
            };

            let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();
            let handshake = self.handshake.clone();
            let ctx = self.ctx.clone();

            tokio::spawn(async move {
                let remote = socket.peer_addr().ok();
                let conn = tokio::select! {
                    opened = handshake.open(connection_id, socket, &ctx) => match opened {
                        Ok(conn) => Some(conn),
                        Err(err) => {
                            warn!(connection_id, ?remote, "handshake failed: {}", err);
                            None
                        }
                    },
                    _ = shutdown.recv() => None,
                };

                if let Some(conn) = conn {
                    let start = conn.start();
                    tokio::pin!(start);
                    tokio::select! {
                        _ = &mut start => {}
                        _ = shutdown.recv() => {
                            conn.stop();
                            start.await;
                        }
                    }
                }
                // whether gracefully or unexpectedly closed, release connection
                drop(permit);
                drop(shutdown_complete_tx);
            });
        }
    }

    /// Retries failed accepts with a doubling delay, reset after a success.
    async fn accept(&self) -> TcpStream {
        let mut backoff = MIN_ACCEPT_BACKOFF;
        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return socket,
                Err(err) => {
                    warn!("accept error: {}, retrying in {:?}", err, backoff);
                }
            }
            time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
        }
    }
}
