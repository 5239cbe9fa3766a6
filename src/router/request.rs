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
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::network::{Connection, Message};
use crate::router::Router;

/// A slice-router handler. Call [`Request::next`] to run the rest of the chain.
pub type RouterHandler = Arc<dyn for<'a> Fn(&'a mut Request) -> BoxFuture<'a, ()> + Send + Sync>;

/// Wraps a closure into a [`RouterHandler`].
///
/// ```ignore
/// let log = handler(|request| {
///     async move {
///         tracing::info!(msg_id = request.msg_id(), "before");
///         request.next().await;
///         tracing::info!(msg_id = request.msg_id(), "after");
///     }
///     .boxed()
/// });
/// ```
pub fn handler<F>(f: F) -> RouterHandler
where
    F: for<'a> Fn(&'a mut Request) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouterStep {
    PreHandle = 0,
    Handle = 1,
    PostHandle = 2,
}

const HANDLE_OVER: u8 = 3;

/// Per-message context: the connection, the message, the routing cursor and
/// whatever the interceptors decoded.
///
/// A request is owned by one handler-chain execution and dropped when it ends.
pub struct Request {
    conn: Arc<Connection>,
    message: Message,
    decoded: Option<Box<dyn Any + Send + Sync>>,
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
    aborted: bool,

    // fixed three-phase router
    step: u8,
    goto_pending: bool,

    // slice router, `index` is the next handler to run
    handlers: Arc<[RouterHandler]>,
    index: usize,
}

impl Request {
    pub fn new(conn: Arc<Connection>, message: Message) -> Self {
        Self {
            conn,
            message,
            decoded: None,
            values: HashMap::new(),
            aborted: false,
            step: RouterStep::PreHandle as u8,
            goto_pending: false,
            handlers: Arc::from(Vec::new()),
            index: 0,
        }
    }

    /// A fresh request on the same connection.
    pub fn fork(&self, message: Message) -> Self {
        Self::new(self.conn.clone(), message)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn conn_id(&self) -> u64 {
        self.conn.conn_id()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn set_message(&mut self, message: Message) {
        self.message = message;
    }

    pub fn msg_id(&self) -> u32 {
        self.message.id
    }

    pub fn data(&self) -> &Bytes {
        &self.message.data
    }

    /// Stores the value a protocol decoder produced for this message.
    pub fn set_decoded<T: Any + Send + Sync>(&mut self, value: T) {
        self.decoded = Some(Box::new(value));
    }

    pub fn decoded<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.decoded.as_ref()?.downcast_ref::<T>()
    }

    pub fn has_decoded(&self) -> bool {
        self.decoded.is_some()
    }

    /// Request-scoped value, dropped with the request.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    /// Stops the remaining phases or handlers. Already-run code is not undone,
    /// and the flag is never cleared.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.goto_pending = false;
        self.step = HANDLE_OVER;
        self.index = self.handlers.len();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Jumps the three-phase cursor, e.g. back to `PreHandle` for a retry.
    /// Ignored once the request is aborted.
    pub fn goto(&mut self, step: RouterStep) {
        if self.aborted {
            return;
        }
        self.step = step as u8;
        self.goto_pending = true;
    }

    /// The phase that runs next.
    pub fn step(&self) -> Option<RouterStep> {
        match self.step {
            0 => Some(RouterStep::PreHandle),
            1 => Some(RouterStep::Handle),
            2 => Some(RouterStep::PostHandle),
            _ => None,
        }
    }

    /// Runs `router` through pre-handle, handle and post-handle.
    pub async fn call_router(&mut self, router: &dyn Router) {
        if self.aborted {
            return;
        }
        self.step = RouterStep::PreHandle as u8;
        while self.step < HANDLE_OVER {
            match self.step {
                0 => router.pre_handle(self).await,
                1 => router.handle(self).await,
                _ => router.post_handle(self).await,
            }
            if self.goto_pending {
                self.goto_pending = false;
            } else if self.step < HANDLE_OVER {
                self.step += 1;
            }
        }
    }

    /// Installs the slice-router chain and runs it from the start.
    pub async fn call_handlers(&mut self, handlers: Arc<[RouterHandler]>) {
        self.handlers = handlers;
        self.index = if self.aborted { self.handlers.len() } else { 0 };
        self.next().await;
    }

    /// Runs the remaining slice handlers. Code a handler places after its own
    /// `next().await` runs once everything downstream has finished.
    pub fn next(&mut self) -> BoxFuture<'_, ()> {
        async move {
            while self.index < self.handlers.len() {
                let handler = self.handlers[self.index].clone();
                self.index += 1;
                handler(self).await;
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::service::{ConnSetup, ServerConfig};
    use crate::testing::{context, duplex_connection};

    #[derive(Default)]
    struct Phases {
        log: Mutex<Vec<&'static str>>,
        abort_in_pre: bool,
        retries: AtomicUsize,
    }

    #[async_trait]
    impl Router for Phases {
        async fn pre_handle(&self, request: &mut Request) {
            self.log.lock().push("pre");
            if self.abort_in_pre {
                request.abort();
                request.goto(RouterStep::Handle);
            }
        }

        async fn handle(&self, request: &mut Request) {
            self.log.lock().push("handle");
            if self.retries.load(Ordering::SeqCst) > 0 {
                self.retries.fetch_sub(1, Ordering::SeqCst);
                request.goto(RouterStep::PreHandle);
            }
        }

        async fn post_handle(&self, _request: &mut Request) {
            self.log.lock().push("post");
        }
    }

    async fn request(msg_id: u32) -> Request {
        let env = context(ConnSetup::new(), ServerConfig::default());
        let (conn, _peer) = duplex_connection(1, &env.ctx);
        Request::new(conn, Message::new(msg_id, "ping"))
    }

    #[tokio::test]
    async fn phases_run_in_order() {
        let router = Phases::default();
        let mut request = request(1).await;
        request.call_router(&router).await;
        assert_eq!(*router.log.lock(), vec!["pre", "handle", "post"]);
        assert_eq!(request.step(), None);
    }

    #[tokio::test]
    async fn goto_repeats_phases() {
        let router = Phases {
            retries: AtomicUsize::new(1),
            ..Default::default()
        };
        let mut request = request(1).await;
        request.call_router(&router).await;
        assert_eq!(
            *router.log.lock(),
            vec!["pre", "handle", "pre", "handle", "post"]
        );
    }

    #[tokio::test]
    async fn abort_is_final() {
        let router = Phases {
            abort_in_pre: true,
            ..Default::default()
        };
        let mut request = request(1).await;
        request.call_router(&router).await;
        assert!(request.is_aborted());
        assert_eq!(*router.log.lock(), vec!["pre"]);

        // an aborted request never runs again
        request.call_router(&router).await;
        assert_eq!(router.log.lock().len(), 1);
    }

    #[tokio::test]
    async fn values_and_decoded_are_typed() {
        let mut request = request(3).await;
        request.set("user", 42u64);
        request.set_decoded(String::from("decoded"));

        assert_eq!(request.get::<u64>("user"), Some(&42));
        assert_eq!(request.get::<u32>("user"), None);
        assert_eq!(request.get::<u64>("missing"), None);
        assert_eq!(request.decoded::<String>().map(String::as_str), Some("decoded"));
        assert!(request.has_decoded());
        assert_eq!(request.msg_id(), 3);
        assert_eq!(request.data().as_ref(), b"ping");

        let forked = request.fork(Message::new(4, "pong"));
        assert_eq!(forked.conn_id(), request.conn_id());
        assert!(!forked.has_decoded());
        assert!(forked.get::<u64>("user").is_none());
    }
}
