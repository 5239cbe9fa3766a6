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

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::interceptor::InterceptorChain;
use crate::network::transport::{self, Inbound, Outbound, Received};
use crate::network::{
    CloseCallbacks, ConnManager, DataPack, FrameDecoder, HeartbeatChecker, HeartbeatSettings,
    Message,
};
use crate::router::{MsgHandler, Request};
use crate::service::ServerConfig;
use crate::{AppError, AppResult};

pub type ConnHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type FrameDecoderFactory = Arc<dyn Fn() -> Box<dyn FrameDecoder> + Send + Sync>;

/// Everything a connection shares with its server (or client) and its sibling
/// connections.
#[derive(Clone)]
pub struct ConnContext {
    pub config: Arc<ServerConfig>,
    pub datapack: Arc<dyn DataPack>,
    /// `None` treats every read as one message, for already-framed transports
    pub frame_decoder: Option<FrameDecoderFactory>,
    pub interceptors: InterceptorChain,
    pub msg_handler: Arc<MsgHandler>,
    pub conn_manager: Arc<ConnManager>,
    pub on_conn_start: Option<ConnHook>,
    pub on_conn_stop: Option<ConnHook>,
    pub heartbeat: Option<HeartbeatSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl From<u8> for ConnState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnState::Created,
            1 => ConnState::Running,
            2 => ConnState::Stopping,
            _ => ConnState::Stopped,
        }
    }
}

/// A connection actor: owns one socket, a reader task and a lazily started
/// writer task.
///
/// `start` drives the connection until it is cancelled by [`Connection::stop`],
/// a read or write failure, or the heartbeat supervisor. The finalizer then
/// runs exactly once, in this order: stop hook, heartbeat stop, writer flush,
/// socket close, removal from the manager, outbound queue close, close
/// callbacks. Flushing and closing are bounded by the flush timeout, so a peer
/// that stopped reading cannot hold the finalizer.
pub struct Connection {
    conn_id: u64,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,

    inbound: Mutex<Option<Inbound>>,
    writer: tokio::sync::Mutex<Option<Outbound>>,
    frame_decoder: Mutex<Option<Box<dyn FrameDecoder>>>,

    datapack: Arc<dyn DataPack>,
    interceptors: InterceptorChain,
    msg_handler: Arc<MsgHandler>,
    conn_manager: Weak<ConnManager>,
    on_conn_start: Option<ConnHook>,
    on_conn_stop: Option<ConnHook>,

    read_buffer_size: usize,
    max_msg_chan_len: usize,
    send_timeout: Duration,
    flush_timeout: Duration,

    heartbeat: Mutex<Option<HeartbeatChecker>>,
    heartbeat_bound: bool,
    last_activity: Mutex<Instant>,

    properties: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    close_callbacks: Mutex<CloseCallbacks>,

    state: AtomicU8,
    closed: AtomicBool,
    cancel: CancellationToken,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new<R, W>(
        conn_id: u64,
        reader: R,
        writer: W,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        ctx: &ConnContext,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_transport(
            conn_id,
            Inbound::Stream(Box::new(reader)),
            Outbound::Stream(Box::new(writer)),
            local_addr,
            remote_addr,
            ctx,
        )
    }

    /// A connection over any byte stream, e.g. a TLS session.
    pub fn from_stream<S>(
        conn_id: u64,
        stream: S,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        ctx: &ConnContext,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(conn_id, reader, writer, local_addr, remote_addr, ctx)
    }

    /// A connection over an upgraded websocket. Every binary message is one
    /// frame and skips the frame decoder; every sent packet is one binary
    /// message.
    pub fn from_websocket<S>(
        conn_id: u64,
        stream: WebSocketStream<S>,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        ctx: &ConnContext,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (inbound, outbound) = transport::websocket(stream);
        Self::with_transport(conn_id, inbound, outbound, local_addr, remote_addr, ctx)
    }

    fn with_transport(
        conn_id: u64,
        inbound: Inbound,
        outbound: Outbound,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        ctx: &ConnContext,
    ) -> Arc<Self> {
        let network = &ctx.config.network;
        Arc::new_cyclic(|weak: &Weak<Connection>| Connection {
            conn_id,
            local_addr,
            remote_addr,
            inbound: Mutex::new(Some(inbound)),
            writer: tokio::sync::Mutex::new(Some(outbound)),
            frame_decoder: Mutex::new(ctx.frame_decoder.as_ref().map(|factory| factory())),
            datapack: ctx.datapack.clone(),
            interceptors: ctx.interceptors.clone(),
            msg_handler: ctx.msg_handler.clone(),
            conn_manager: Arc::downgrade(&ctx.conn_manager),
            on_conn_start: ctx.on_conn_start.clone(),
            on_conn_stop: ctx.on_conn_stop.clone(),
            read_buffer_size: network.io_read_buffer_size.max(1),
            max_msg_chan_len: network.max_msg_chan_len.max(1),
            send_timeout: network.send_buffer_timeout(),
            flush_timeout: network.flush_timeout(),
            heartbeat: Mutex::new(
                ctx.heartbeat
                    .as_ref()
                    .map(|settings| HeartbeatChecker::new(weak.clone(), settings)),
            ),
            heartbeat_bound: ctx.heartbeat.is_some(),
            last_activity: Mutex::new(Instant::now()),
            properties: RwLock::new(HashMap::new()),
            close_callbacks: Mutex::new(CloseCallbacks::default()),
            state: AtomicU8::new(ConnState::Created as u8),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            outbound: Mutex::new(None),
            writer_task: Mutex::new(None),
        })
    }

    pub fn from_tcp(conn_id: u64, stream: TcpStream, ctx: &ConnContext) -> Arc<Self> {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        if let Err(err) = stream.set_nodelay(true) {
            debug!(conn_id, "set nodelay failed: {}", err);
        }
        let (reader, writer) = stream.into_split();
        Self::new(conn_id, reader, writer, local_addr, remote_addr, ctx)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> ConnState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.closed.load(Ordering::Acquire)
    }

    /// A token cancelled when this connection stops. Cancelling the returned
    /// token does not stop the connection.
    pub fn done(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Runs the connection until it stops, then finalizes it.
    pub async fn start(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                ConnState::Created as u8,
                ConnState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!(conn_id = self.conn_id, "connection started twice");
            return;
        }

        if let Some(manager) = self.conn_manager.upgrade() {
            manager.add(self.clone());
        }
        debug!(
            conn_id = self.conn_id,
            remote = ?self.remote_addr,
            "connection started"
        );

        if let Some(hook) = &self.on_conn_start {
            hook(self);
        }
        if let Some(checker) = self.heartbeat.lock().as_ref() {
            checker.start();
        }

        let inbound = self.inbound.lock().take();
        let decoder = self.frame_decoder.lock().take();
        if let Some(inbound) = inbound {
            tokio::spawn(self.clone().read_loop(inbound, decoder));
        }

        self.cancel.cancelled().await;
        self.finalize().await;
    }

    /// Idempotent; only the first call has an effect.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!(conn_id = self.conn_id, "stopping connection");
        }
        self.cancel.cancel();
    }

    async fn read_loop(
        self: Arc<Self>,
        mut inbound: Inbound,
        mut decoder: Option<Box<dyn FrameDecoder>>,
    ) {
        let mut buffer = BytesMut::with_capacity(self.read_buffer_size);
        loop {
            buffer.reserve(self.read_buffer_size);
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = inbound.read(&mut buffer) => read,
            };
            let received = match read {
                Ok(Received::Eof) => {
                    debug!(conn_id = self.conn_id, "connection closed by peer");
                    break;
                }
                Ok(received) => received,
                Err(err) => {
                    warn!(conn_id = self.conn_id, "read error: {}", err);
                    break;
                }
            };

            if self.heartbeat_bound {
                self.update_activity();
            }

            match received {
                Received::Message(message) => {
                    trace!(conn_id = self.conn_id, "read message of {} bytes", message.len());
                    self.handle_frame(message).await;
                }
                Received::Chunk(n) => {
                    trace!(conn_id = self.conn_id, "read {} bytes", n);
                    let chunk = buffer.split().freeze();
                    match decoder.as_mut() {
                        Some(decoder) => {
                            for frame in decoder.decode(&chunk) {
                                self.handle_frame(frame).await;
                            }
                        }
                        None => self.handle_frame(chunk).await,
                    }
                }
                Received::Eof => break,
            }
        }
        self.stop();
    }

    async fn handle_frame(self: &Arc<Self>, frame: Bytes) {
        let request = Request::new(self.clone(), Message::from_frame(frame));
        for request in self.interceptors.execute(request) {
            let msg_id = request.msg_id();
            if let Err(err) = self.msg_handler.dispatch(request).await {
                warn!(conn_id = self.conn_id, msg_id, "dispatch failed: {}", err);
            }
        }
    }

    async fn finalize(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(ConnState::Stopping as u8, Ordering::Release);

        if let Some(hook) = &self.on_conn_stop {
            hook(self);
        }

        let checker = self.heartbeat.lock().take();
        if let Some(checker) = checker {
            checker.stop();
        }

        // let the writer flush what was queued before the stop
        let writer_task = self.writer_task.lock().take();
        if let Some(mut writer_task) = writer_task {
            match time::timeout(self.flush_timeout, &mut writer_task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(conn_id = self.conn_id, "writer task failed: {}", err);
                }
                Err(_) => {
                    warn!(
                        conn_id = self.conn_id,
                        "writer not flushed within {:?}, aborted", self.flush_timeout
                    );
                    writer_task.abort();
                }
            }
        }
        self.close_socket().await;

        if let Some(manager) = self.conn_manager.upgrade() {
            manager.remove(self);
        }

        drop(self.outbound.lock().take());

        let callbacks = std::mem::take(&mut *self.close_callbacks.lock());
        callbacks.invoke();

        self.state.store(ConnState::Stopped as u8, Ordering::Release);
        debug!(conn_id = self.conn_id, "connection stopped");
    }

    async fn close_socket(&self) {
        let Ok(mut guard) = time::timeout(self.flush_timeout, self.writer.lock()).await else {
            warn!(
                conn_id = self.conn_id,
                "socket still busy after {:?}, left to drop", self.flush_timeout
            );
            return;
        };
        let Some(mut outbound) = guard.take() else {
            return;
        };
        drop(guard);
        match time::timeout(self.flush_timeout, outbound.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => trace!(conn_id = self.conn_id, "socket shutdown error: {}", err),
            Err(_) => trace!(conn_id = self.conn_id, "socket shutdown timed out"),
        }
    }

    /// Packs and writes the message directly to the socket.
    pub async fn send(&self, msg_id: u32, data: impl Into<Bytes>) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed(self.conn_id));
        }
        let packet = self.datapack.pack(&Message::new(msg_id, data));
        self.write_packet(packet).await
    }

    /// Packs the message and queues it for the writer task.
    ///
    /// Waits at most the configured send-buffer timeout for queue space and
    /// fails with [`AppError::SendBufferTimeout`] after that.
    pub async fn send_buffered(
        self: &Arc<Self>,
        msg_id: u32,
        data: impl Into<Bytes>,
    ) -> AppResult<()> {
        let sender = self.outbound_sender()?;
        let packet = self.datapack.pack(&Message::new(msg_id, data));
        sender
            .send_timeout(packet, self.send_timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => AppError::SendBufferTimeout(self.conn_id),
                SendTimeoutError::Closed(_) => AppError::ConnectionClosed(self.conn_id),
            })
    }

    fn outbound_sender(self: &Arc<Self>) -> AppResult<mpsc::Sender<Bytes>> {
        let mut outbound = self.outbound.lock();
        if self.is_closed() {
            return Err(AppError::ConnectionClosed(self.conn_id));
        }
        if let Some(sender) = outbound.as_ref() {
            return Ok(sender.clone());
        }
        let (sender, receiver) = mpsc::channel(self.max_msg_chan_len);
        *self.writer_task.lock() = Some(tokio::spawn(self.clone().write_loop(receiver)));
        *outbound = Some(sender.clone());
        Ok(sender)
    }

    async fn write_loop(self: Arc<Self>, mut receiver: mpsc::Receiver<Bytes>) {
        trace!(conn_id = self.conn_id, "writer started");
        loop {
            tokio::select! {
                biased;
                packet = receiver.recv() => match packet {
                    Some(packet) => {
                        if let Err(err) = self.write_packet(packet).await {
                            warn!(conn_id = self.conn_id, "writer exits: {}", err);
                            break;
                        }
                    }
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }
        trace!(conn_id = self.conn_id, "writer exited");
    }

    /// Once the connection is cancelled a pending write gets at most the
    /// flush timeout, so the socket lock is always released.
    async fn write_packet(&self, packet: Bytes) -> AppResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(AppError::ConnectionClosed(self.conn_id))?;
        let result = {
            let write = writer.write_packet(packet);
            tokio::pin!(write);
            tokio::select! {
                biased;
                result = &mut write => result,
                _ = self.cancel.cancelled() => {
                    match time::timeout(self.flush_timeout, &mut write).await {
                        Ok(result) => result,
                        Err(_) => Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "peer stopped reading",
                        )),
                    }
                }
            }
        };
        if let Err(err) = result {
            drop(guard);
            self.stop();
            return Err(AppError::DetailedIoError(format!(
                "write to connection {} error: {}",
                self.conn_id, err
            )));
        }
        Ok(())
    }

    /// Runs `task` on this connection's worker, ordered with its messages.
    pub async fn submit_task<F, Fut>(&self, task: F) -> AppResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.msg_handler
            .submit_func(self.conn_id, Box::new(move || task().boxed()))
            .await
    }

    pub fn set_property<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.properties.write().insert(key.into(), Arc::new(value));
    }

    pub fn get_property<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.properties.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove_property(&self, key: &str) {
        self.properties.write().remove(key);
    }

    pub fn add_close_callback<F>(&self, handler: &str, key: &str, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.close_callbacks.lock().add(handler, key, callback);
    }

    pub fn remove_close_callback(&self, handler: &str, key: &str) {
        self.close_callbacks.lock().remove(handler, key);
    }

    pub fn update_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Whether the peer has been heard from within `max_idle`.
    pub fn is_alive(&self, max_idle: Duration) -> bool {
        self.last_activity().elapsed() < max_idle
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}
