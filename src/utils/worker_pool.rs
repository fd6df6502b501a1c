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

use std::any::type_name;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::{AppError, AppResult, Shutdown};

/// Handler trait for processing tasks
pub trait PoolHandler<T>: Clone + Send + 'static + Sync {
    /// Handle the task
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

/// How tasks are spread over workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOrder {
    /// One queue shared by every worker. Two tasks with the same key may be
    /// handled concurrently and finish in any order.
    #[default]
    Shared,
    /// One queue per worker, the queue picked by the task key. Tasks with the
    /// same key are handled one after another, in submission order.
    PerConnection,
}

/// Worker Pool Config Parameters
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Channel Capacity
    pub channel_capacity: usize,
    pub num_workers: usize,
    pub order: DispatchOrder,
    /// Monitor Interval
    pub monitor_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_workers: num_cpus::get(),
            order: DispatchOrder::Shared,
            monitor_interval: Duration::from_secs(5),
        }
    }
}

/// represent a running worker
#[derive(Debug)]
struct Worker {
    id: usize,
    lane: usize,
    handle: JoinHandle<()>,
}

/// Pool of tokio workers fed through bounded channels.
///
/// Workers that panic are restarted by a monitor task. `stop` discards tasks
/// that were queued but not yet started and waits for running ones.
#[derive(Debug)]
pub struct WorkerPool<T> {
    lanes: Vec<async_channel::Sender<T>>,
    workers: Arc<Mutex<Vec<Worker>>>,
    stopping: Arc<AtomicBool>,
    outstanding: Arc<AtomicUsize>,
    notify_shutdown: broadcast::Sender<()>,
}

/// Decrements the outstanding counter even when the handler panics.
struct OutstandingGuard(Arc<AtomicUsize>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T: Send + Debug + 'static> WorkerPool<T> {
    pub fn new<H: PoolHandler<T>>(
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
        config: WorkerPoolConfig,
    ) -> Self {
        let num_workers = config.num_workers.max(1);
        let num_lanes = match config.order {
            DispatchOrder::Shared => 1,
            DispatchOrder::PerConnection => num_workers,
        };
        let stopping = Arc::new(AtomicBool::new(false));
        let outstanding = Arc::new(AtomicUsize::new(0));

        let mut senders = Vec::with_capacity(num_lanes);
        let mut receivers = Vec::with_capacity(num_lanes);
        for _ in 0..num_lanes {
            let (sender, receiver) = async_channel::bounded(config.channel_capacity.max(1));
            senders.push(sender);
            receivers.push(receiver);
        }

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let lane = id % num_lanes;
            workers.push(Self::spawn_worker(
                id,
                lane,
                handler.clone(),
                receivers[lane].clone(),
                stopping.clone(),
                outstanding.clone(),
            ));
        }
        let workers = Arc::new(Mutex::new(workers));

        Self::spawn_monitor(
            workers.clone(),
            receivers,
            handler,
            notify_shutdown.clone(),
            stopping.clone(),
            outstanding.clone(),
            config.monitor_interval,
        );

        Self {
            lanes: senders,
            workers,
            stopping,
            outstanding,
            notify_shutdown,
        }
    }

    /// Queues `task`; `key` selects the lane in `PerConnection` mode.
    pub async fn submit(&self, task: T, key: u64) -> AppResult<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(AppError::IllegalStateError("worker pool is stopping".into()));
        }
        let lane = (key % self.lanes.len() as u64) as usize;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.lanes[lane].send(task).await {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(AppError::ChannelSendError(e.to_string()));
        }
        Ok(())
    }

    /// Tasks queued or running.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Drops queued tasks, lets running ones finish (each worker gets up to
    /// `grace`), then joins the workers.
    pub async fn stop(&self, grace: Duration) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.notify_shutdown.send(());
        for lane in &self.lanes {
            lane.close();
        }
        let workers: Vec<Worker> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let id = worker.id;
            match time::timeout(grace, worker.handle).await {
                Ok(Ok(())) => trace!("worker {id} joined"),
                Ok(Err(e)) if e.is_panic() => Self::log_worker_panic(id, e),
                Ok(Err(_)) => warn!("worker {id} was cancelled"),
                Err(_) => warn!("worker {id} still busy after {:?}, detaching", grace),
            }
        }
        debug!("worker pool stopped, {} tasks outstanding", self.outstanding());
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: usize,
        lane: usize,
        handler: H,
        receiver: async_channel::Receiver<T>,
        stopping: Arc<AtomicBool>,
        outstanding: Arc<AtomicUsize>,
    ) -> Worker {
        let handle = tokio::spawn(async move {
            debug!("Worker {id} started on lane {lane}");
            while let Ok(task) = receiver.recv().await {
                let _guard = OutstandingGuard(outstanding.clone());
                if stopping.load(Ordering::Acquire) {
                    trace!("Worker {id} discarding queued task: {:?}", task);
                    continue;
                }
                handler.handle(task).await;
            }
            debug!("Worker {id} exited");
        });

        Worker { id, lane, handle }
    }

    fn spawn_monitor<H: PoolHandler<T>>(
        workers: Arc<Mutex<Vec<Worker>>>,
        receivers: Vec<async_channel::Receiver<T>>,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        stopping: Arc<AtomicBool>,
        outstanding: Arc<AtomicUsize>,
        monitor_interval: Duration,
    ) {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            let mut interval = time::interval(monitor_interval);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Worker monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        let mut finished = Vec::new();
                        {
                            let mut workers = workers.lock();
                            if stopping.load(Ordering::Acquire) {
                                break;
                            }
                            for worker in workers.iter_mut() {
                                if !worker.handle.is_finished() {
                                    trace!("Worker {} is running", worker.id);
                                    continue;
                                }
                                warn!("Worker {} failed, restarting...", worker.id);
                                let replacement = Self::spawn_worker(
                                    worker.id,
                                    worker.lane,
                                    handler.clone(),
                                    receivers[worker.lane].clone(),
                                    stopping.clone(),
                                    outstanding.clone(),
                                );
                                finished.push(std::mem::replace(worker, replacement));
                            }
                        }
                        for worker in finished {
                            match worker.handle.await {
                                Ok(()) => warn!("Worker {} completed unexpectedly", worker.id),
                                Err(err) if err.is_panic() => Self::log_worker_panic(worker.id, err),
                                Err(_) => error!("Worker {} failed with non-panic error", worker.id),
                            }
                        }
                    }
                }
            }
            debug!("Worker monitor exiting");
        });
    }

    fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("Worker {worker_id} panicked with message: {message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("Worker {worker_id} panicked with message: {message}");
        } else {
            error!(
                "Worker {worker_id} panicked with an unknown type: {}",
                get_type_name(&payload)
            );
        }
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
