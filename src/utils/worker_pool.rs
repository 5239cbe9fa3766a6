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
use std::panic::AssertUnwindSafe;

use async_channel::TrySendError;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

use crate::utils::panic_message;
use crate::{AppError, AppResult, Shutdown};

/// Handler trait for processing tasks
pub trait PoolHandler<T>: Clone + Send + Sync + 'static {
    /// Handle the task
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

/// What `submit` does when the target worker's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// wait for queue space
    #[default]
    Block,
    /// fail with `AppError::WorkerQueueFull`
    Drop,
}

/// Worker Pool Config Parameters
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Worker number; zero spawns a task per submission instead
    pub num_workers: usize,
    /// Channel Capacity of every worker
    pub channel_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 10,
            channel_capacity: 1024,
            overflow_policy: OverflowPolicy::Block,
        }
    }
}

/// A fixed set of workers, each draining its own bounded queue.
///
/// A submission key is mapped to worker `key % num_workers` so that all tasks
/// with the same key run sequentially, in submission order, while different
/// keys progress in parallel. The worker count never changes after
/// construction.
#[derive(Debug)]
pub struct WorkerPool<T, H> {
    notify_shutdown: broadcast::Sender<()>,
    channels: Vec<async_channel::Sender<T>>,
    handler: H,
    config: WorkerPoolConfig,
}

impl<T: Send + 'static, H: PoolHandler<T>> WorkerPool<T, H> {
    /// Spawns the workers; must be called within a tokio runtime. Every worker
    /// holds a clone of `shutdown_complete_tx` until it exits.
    pub fn new(
        handler: H,
        config: WorkerPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        let channels = (0..config.num_workers)
            .map(|id| {
                let (sender, receiver) = async_channel::bounded(config.channel_capacity.max(1));
                Self::spawn_worker(
                    id,
                    handler.clone(),
                    Shutdown::new(notify_shutdown.subscribe()),
                    shutdown_complete_tx.clone(),
                    receiver,
                );
                sender
            })
            .collect();

        Self {
            notify_shutdown,
            channels,
            handler,
            config,
        }
    }

    pub fn size(&self) -> usize {
        self.channels.len()
    }

    pub fn get_pool_config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// The worker owning `key`, `None` when the pool has no workers.
    pub fn worker_index(&self, key: u64) -> Option<usize> {
        if self.channels.is_empty() {
            None
        } else {
            Some((key % self.channels.len() as u64) as usize)
        }
    }

    pub async fn submit(&self, key: u64, task: T) -> AppResult<()> {
        let Some(index) = self.worker_index(key) else {
            // no ordering between tasks of one key in this mode
            let handler = self.handler.clone();
            tokio::spawn(async move { run_guarded(&handler, task, None).await });
            return Ok(());
        };

        let sender = &self.channels[index];
        match self.config.overflow_policy {
            OverflowPolicy::Block => sender
                .send(task)
                .await
                .map_err(|_| AppError::ChannelSendError(format!("worker {index} is closed"))),
            OverflowPolicy::Drop => sender.try_send(task).map_err(|err| match err {
                TrySendError::Full(_) => AppError::WorkerQueueFull(index),
                TrySendError::Closed(_) => {
                    AppError::ChannelSendError(format!("worker {index} is closed"))
                }
            }),
        }
    }

    /// Signals every worker to exit; queued tasks are dropped.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }

    fn spawn_worker(
        id: usize,
        handler: H,
        mut shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
        receiver: async_channel::Receiver<T>,
    ) {
        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            debug!("Worker {id} started");

            loop {
                tokio::select! {
                    task = receiver.recv() => match task {
                        Ok(task) => run_guarded(&handler, task, Some(id)).await,
                        Err(_) => break,
                    },
                    _ = shutdown.recv() => {
                        debug!("Worker {id} shutting down");
                        break;
                    }
                }
            }
            debug!("Worker {id} exited");
        });
    }
}

/// A panicking task is logged and dropped; the worker keeps running.
async fn run_guarded<T, H: PoolHandler<T>>(handler: &H, task: T, worker: Option<usize>) {
    if let Err(payload) = AssertUnwindSafe(handler.handle(task)).catch_unwind().await {
        error!(
            worker = ?worker,
            "task panicked with message: {}",
            panic_message(payload.as_ref())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wait_until;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn channels() -> (broadcast::Sender<()>, mpsc::Sender<()>) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        (notify_shutdown, shutdown_complete_tx)
    }

    #[derive(Clone)]
    struct TestHandler {
        counter: Arc<AtomicI32>,
    }

    impl PoolHandler<i32> for TestHandler {
        fn handle(&self, task: i32) -> impl Future<Output = ()> + Send {
            let counter = self.counter.clone();
            async move {
                counter.fetch_add(task, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_worker_pool() {
        let (notify_shutdown, shutdown_complete_tx) = channels();
        let handler = TestHandler {
            counter: Arc::new(AtomicI32::new(0)),
        };
        let config = WorkerPoolConfig {
            num_workers: 2,
            channel_capacity: 10,
            ..Default::default()
        };
        let pool = WorkerPool::new(handler.clone(), config, notify_shutdown, shutdown_complete_tx);

        // 发送任务到不同的 worker
        pool.submit(0, 1).await.unwrap();
        pool.submit(1, 2).await.unwrap();

        let counter = handler.counter.clone();
        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 3).await);
    }

    #[tokio::test]
    async fn test_worker_survives_panic() {
        #[derive(Clone)]
        struct PanicHandler {
            done: Arc<AtomicI32>,
        }

        impl PoolHandler<bool> for PanicHandler {
            fn handle(&self, should_panic: bool) -> impl Future<Output = ()> + Send {
                let done = self.done.clone();
                async move {
                    if should_panic {
                        panic!("Test panic");
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let (notify_shutdown, shutdown_complete_tx) = channels();
        let done = Arc::new(AtomicI32::new(0));
        let config = WorkerPoolConfig {
            num_workers: 1,
            channel_capacity: 10,
            ..Default::default()
        };
        let pool = WorkerPool::new(
            PanicHandler { done: done.clone() },
            config,
            notify_shutdown,
            shutdown_complete_tx,
        );

        pool.submit(0, true).await.unwrap();
        pool.submit(0, false).await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst) == 1).await);
    }

    #[derive(Clone, Default)]
    struct RecordingHandler {
        seen: Arc<parking_lot::Mutex<HashMap<u64, Vec<u32>>>>,
    }

    impl PoolHandler<(u64, u32)> for RecordingHandler {
        fn handle(&self, (key, seq): (u64, u32)) -> impl Future<Output = ()> + Send {
            let seen = self.seen.clone();
            async move {
                // yield so that workers interleave
                tokio::task::yield_now().await;
                seen.lock().entry(key).or_default().push(seq);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn keeps_per_key_order() {
        let (notify_shutdown, shutdown_complete_tx) = channels();
        let handler = RecordingHandler::default();
        let config = WorkerPoolConfig {
            num_workers: 4,
            channel_capacity: 16,
            ..Default::default()
        };
        let pool = WorkerPool::new(handler.clone(), config, notify_shutdown, shutdown_complete_tx);

        for seq in 0..100 {
            for key in 0..8u64 {
                pool.submit(key, (key, seq)).await.unwrap();
            }
        }

        let seen = handler.seen.clone();
        assert!(
            wait_until(Duration::from_secs(5), || {
                seen.lock().values().map(Vec::len).sum::<usize>() == 800
            })
            .await
        );
        let expected: Vec<u32> = (0..100).collect();
        for key in 0..8u64 {
            assert_eq!(seen.lock()[&key], expected, "key {key}");
        }
    }

    #[tokio::test]
    async fn worker_index_is_key_modulo_size() {
        let (notify_shutdown, shutdown_complete_tx) = channels();
        let config = WorkerPoolConfig {
            num_workers: 3,
            ..Default::default()
        };
        let pool = WorkerPool::new(
            RecordingHandler::default(),
            config,
            notify_shutdown,
            shutdown_complete_tx,
        );
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.worker_index(7), Some(1));
        assert_eq!(pool.worker_index(9), Some(0));
    }

    /// Blocks every task until the gate opens.
    #[derive(Clone)]
    struct GateHandler {
        started: mpsc::UnboundedSender<u32>,
        gate: Arc<Semaphore>,
    }

    impl PoolHandler<u32> for GateHandler {
        fn handle(&self, task: u32) -> impl Future<Output = ()> + Send {
            let started = self.started.clone();
            let gate = self.gate.clone();
            async move {
                let _ = started.send(task);
                let _ = gate.acquire().await;
            }
        }
    }

    fn gated_pool(
        policy: OverflowPolicy,
    ) -> (
        WorkerPool<u32, GateHandler>,
        mpsc::UnboundedReceiver<u32>,
        Arc<Semaphore>,
    ) {
        let (notify_shutdown, shutdown_complete_tx) = channels();
        let (started, started_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let config = WorkerPoolConfig {
            num_workers: 1,
            channel_capacity: 1,
            overflow_policy: policy,
        };
        let pool = WorkerPool::new(
            GateHandler {
                started,
                gate: gate.clone(),
            },
            config,
            notify_shutdown,
            shutdown_complete_tx,
        );
        (pool, started_rx, gate)
    }

    #[tokio::test]
    async fn drop_policy_rejects_when_queue_is_full() {
        let (pool, mut started, gate) = gated_pool(OverflowPolicy::Drop);

        pool.submit(0, 1).await.unwrap();
        assert_eq!(started.recv().await, Some(1));
        // the worker is busy with 1, the queue holds 2
        pool.submit(0, 2).await.unwrap();

        assert!(matches!(
            pool.submit(0, 3).await,
            Err(AppError::WorkerQueueFull(0))
        ));

        gate.add_permits(10);
        assert_eq!(started.recv().await, Some(2));
    }

    #[tokio::test]
    async fn block_policy_waits_for_queue_space() {
        let (pool, mut started, gate) = gated_pool(OverflowPolicy::Block);

        pool.submit(0, 1).await.unwrap();
        assert_eq!(started.recv().await, Some(1));
        pool.submit(0, 2).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.submit(0, 3)).await;
        assert!(blocked.is_err(), "submit should wait while the queue is full");

        gate.add_permits(10);
        tokio::time::timeout(Duration::from_secs(2), pool.submit(0, 3))
            .await
            .expect("queue space freed")
            .unwrap();
        assert_eq!(started.recv().await, Some(2));
        assert_eq!(started.recv().await, Some(3));
    }

    #[tokio::test]
    async fn zero_workers_spawn_a_task_per_submission() {
        let (notify_shutdown, shutdown_complete_tx) = channels();
        let handler = TestHandler {
            counter: Arc::new(AtomicI32::new(0)),
        };
        let config = WorkerPoolConfig {
            num_workers: 0,
            ..Default::default()
        };
        let pool = WorkerPool::new(handler.clone(), config, notify_shutdown, shutdown_complete_tx);
        assert_eq!(pool.worker_index(42), None);

        for i in 1..=10 {
            pool.submit(7, i).await.unwrap();
        }
        let counter = handler.counter.clone();
        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 55).await);
    }

    #[tokio::test]
    async fn shutdown_stops_workers() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
        let config = WorkerPoolConfig {
            num_workers: 2,
            ..Default::default()
        };
        let pool = WorkerPool::new(
            RecordingHandler::default(),
            config,
            notify_shutdown,
            shutdown_complete_tx,
        );

        pool.shutdown();
        // resolves once every worker dropped its sender
        tokio::time::timeout(Duration::from_secs(2), shutdown_complete_rx.recv())
            .await
            .expect("workers exited");
    }
}
