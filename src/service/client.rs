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

use std::sync::Arc;

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, error};

use crate::network::{ConnContext, ConnManager, Connection};
use crate::service::{ConnSetup, ServerConfig};
use crate::{AppError, AppResult};

/// Dials servers and runs the resulting connections with the same routing,
/// interceptors and heartbeat machinery a server uses.
///
/// Every connection is registered in the client's [`ConnManager`] while it
/// runs. Routes and the worker pool are built on the first connect; changes
/// made through [`Client::setup_mut`] after that are ignored.
pub struct Client {
    config: Arc<ServerConfig>,
    setup: ConnSetup,
    ctx: Option<ConnContext>,
    conn_manager: Arc<ConnManager>,
    next_conn_id: u64,
}

impl Client {
    pub fn new(config: ServerConfig, setup: ConnSetup) -> Self {
        Client {
            config: Arc::new(config),
            setup,
            ctx: None,
            conn_manager: Arc::new(ConnManager::new()),
            next_conn_id: 0,
        }
    }

    pub fn setup_mut(&mut self) -> &mut ConnSetup {
        &mut self.setup
    }

    pub fn conn_manager(&self) -> Arc<ConnManager> {
        self.conn_manager.clone()
    }

    /// Connects to `addr` and starts the connection in the background.
    pub async fn connect<A: ToSocketAddrs>(&mut self, addr: A) -> AppResult<Arc<Connection>> {
        let stream = TcpStream::connect(addr).await.map_err(connect_error)?;
        let (conn_id, ctx) = self.next_context();
        Ok(Self::run(Connection::from_tcp(conn_id, stream, &ctx)))
    }

    /// Connects to `addr` over TLS, verifying the server as `server_name`.
    pub async fn connect_tls<A: ToSocketAddrs>(
        &mut self,
        addr: A,
        server_name: &str,
        tls: Arc<ClientConfig>,
    ) -> AppResult<Arc<Connection>> {
        let domain = ServerName::try_from(server_name.to_owned())
            .map_err(|err| AppError::InvalidValue(format!("server name {}: {}", server_name, err)))?;
        let stream = TcpStream::connect(addr).await.map_err(connect_error)?;
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        let stream = TlsConnector::from(tls).connect(domain, stream).await?;

        let (conn_id, ctx) = self.next_context();
        Ok(Self::run(Connection::from_stream(
            conn_id,
            stream,
            local_addr,
            remote_addr,
            &ctx,
        )))
    }

    /// Connects to a `ws://` url; every packet travels as one binary message.
    pub async fn connect_websocket(&mut self, url: &str) -> AppResult<Arc<Connection>> {
        let (stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|err| {
            error!("client websocket connect error: {}", err);
            AppError::DetailedIoError(format!("websocket connect {} error: {}", url, err))
        })?;
        let (local_addr, remote_addr) = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => (tcp.local_addr().ok(), tcp.peer_addr().ok()),
            _ => (None, None),
        };

        let (conn_id, ctx) = self.next_context();
        Ok(Self::run(Connection::from_websocket(
            conn_id,
            stream,
            local_addr,
            remote_addr,
            &ctx,
        )))
    }

    fn next_context(&mut self) -> (u64, ConnContext) {
        let ctx = match &self.ctx {
            Some(ctx) => ctx.clone(),
            None => {
                // the workers live as long as a connection or this client holds the context
                let (notify_shutdown, _) = broadcast::channel(1);
                let (shutdown_complete_tx, _) = mpsc::channel(1);
                let ctx = std::mem::take(&mut self.setup).build(
                    self.config.clone(),
                    self.conn_manager.clone(),
                    notify_shutdown,
                    shutdown_complete_tx,
                );
                self.ctx = Some(ctx.clone());
                ctx
            }
        };
        self.next_conn_id += 1;
        (self.next_conn_id, ctx)
    }

    fn run(conn: Arc<Connection>) -> Arc<Connection> {
        debug!(conn_id = conn.conn_id(), remote = ?conn.remote_addr(), "client connected");
        let runner = conn.clone();
        tokio::spawn(async move { runner.start().await });
        conn
    }
}

fn connect_error(err: std::io::Error) -> AppError {
    error!("client connect error: {}", err);
    AppError::DetailedIoError(format!("connect error: {}", err))
}
