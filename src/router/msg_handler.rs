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
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};

use crate::router::{Request, Route, RouterTable};
use crate::utils::{PoolHandler, WorkerPool, WorkerPoolConfig};
use crate::AppResult;

/// A closure scheduled on a connection's worker.
pub type FuncTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub enum Task {
    Request(Request),
    Func(FuncTask),
}

#[derive(Clone)]
struct TaskRunner {
    routes: Arc<RouterTable>,
}

impl PoolHandler<Task> for TaskRunner {
    fn handle(&self, task: Task) -> impl Future<Output = ()> + Send {
        let routes = self.routes.clone();
        async move {
            match task {
                Task::Request(mut request) => do_msg_handler(&routes, &mut request).await,
                Task::Func(func) => func().await,
            }
        }
    }
}

async fn do_msg_handler(routes: &RouterTable, request: &mut Request) {
    let msg_id = request.msg_id();
    match routes.resolve(msg_id) {
        Some(Route::Fixed(router)) => request.call_router(router.as_ref()).await,
        Some(Route::Slices(handlers)) => request.call_handlers(handlers).await,
        None => {
            warn!(conn_id = request.conn_id(), msg_id, "api not found, need register");
            return;
        }
    }
    trace!(conn_id = request.conn_id(), msg_id, "request handled");
}

/// Routes requests to their handler chain on the worker that owns the
/// connection.
pub struct MsgHandler {
    routes: Arc<RouterTable>,
    pool: WorkerPool<Task, TaskRunner>,
}

impl MsgHandler {
    /// # Panics
    ///
    /// Panics if `routes` registers one message id twice.
    pub fn new(
        routes: RouterTable,
        config: WorkerPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        routes.validate();
        let routes = Arc::new(routes);
        let pool = WorkerPool::new(
            TaskRunner {
                routes: routes.clone(),
            },
            config,
            notify_shutdown,
            shutdown_complete_tx,
        );
        Self { routes, pool }
    }

    pub fn routes(&self) -> &RouterTable {
        &self.routes
    }

    pub fn worker_index(&self, conn_id: u64) -> Option<usize> {
        self.pool.worker_index(conn_id)
    }

    pub async fn dispatch(&self, request: Request) -> AppResult<()> {
        let conn_id = request.conn_id();
        self.pool.submit(conn_id, Task::Request(request)).await
    }

    pub async fn submit_func(&self, conn_id: u64, func: FuncTask) -> AppResult<()> {
        self.pool.submit(conn_id, Task::Func(func)).await
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
