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

//! Fixtures shared by the server integration tests: a server on an ephemeral
//! port and big-endian TLV helpers.

// not every test binary uses every helper
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::FutureExt;
use stonenet::router::handler;
use stonenet::{AppResult, ConnSetup, Server, ServerConfig};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const ECHO: u32 = 1;
pub const REPLY: u32 = 2;

pub fn tlv(id: u32, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + body.len());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&(body.len() as u32).to_be_bytes());
    packet.extend_from_slice(body);
    packet
}

pub async fn read_tlv<S: AsyncRead + Unpin>(stream: &mut S) -> (u32, Vec<u8>) {
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).await.unwrap();
    let id = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let len = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await.unwrap();
    (id, body)
}

/// Answers every `ECHO` with a `REPLY` carrying the same body.
pub fn echo_setup() -> ConnSetup {
    let mut setup = ConnSetup::new();
    setup.add_handler(
        ECHO,
        [handler(|request| {
            async move {
                let data = request.data().clone();
                let _ = request.connection().send(REPLY, data).await;
            }
            .boxed()
        })],
    );
    setup
}

pub struct RunningServer {
    pub addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<AppResult<()>>,
}

impl RunningServer {
    pub async fn start(config: ServerConfig, setup: ConnSetup) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, signal) = oneshot::channel::<()>();
        let server = Server::new(config, setup);
        let handle = tokio::spawn(server.run(listener, signal));
        RunningServer {
            addr,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();
    }
}
