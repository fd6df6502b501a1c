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

//! Runs jobs on one dedicated OS thread.
//!
//! Every job handed to an `AsyncExecutor` executes on its pinned thread, in
//! submission order. A caller that already is the pinned thread runs the job
//! inline. Queued jobs are never cancelled; once the executor is shut down,
//! jobs still in the queue are executed before the thread exits, and new
//! submissions fail.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use crate::AppResult;

type Job = Box<dyn FnOnce() -> bool + Send + 'static>;

#[derive(Debug)]
pub struct AsyncExecutor {
    name: String,
    job_tx: async_channel::Sender<Job>,
    thread_id: ThreadId,
}

#[derive(Default)]
struct Completion {
    result: Mutex<Option<bool>>,
    ready: Condvar,
}

impl Completion {
    fn complete(&self, value: bool) {
        *self.result.lock() = Some(value);
        self.ready.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut result = self.result.lock();
        while result.is_none() {
            if self.ready.wait_until(&mut result, deadline).timed_out() {
                break;
            }
        }
        *result
    }
}

fn run_guarded<F>(job: F) -> bool
where
    F: FnOnce() -> bool,
{
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(result) => result,
        Err(payload) => {
            if let Some(message) = payload.downcast_ref::<&'static str>() {
                error!("executor job panicked with message: {}", message);
            } else if let Some(message) = payload.downcast_ref::<String>() {
                error!("executor job panicked with message: {}", message);
            } else {
                error!("executor job panicked with an unknown payload");
            }
            false
        }
    }
}

impl AsyncExecutor {
    /// Spawns the pinned thread; `name` becomes the OS thread name.
    pub fn new(name: &str) -> AppResult<Self> {
        let (job_tx, job_rx) = async_channel::unbounded::<Job>();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("executor {} started", thread_name);
                while let Ok(job) = job_rx.recv_blocking() {
                    run_guarded(job);
                }
                debug!("executor {} exited", thread_name);
            })?;

        Ok(AsyncExecutor {
            name: name.to_string(),
            job_tx,
            thread_id: handle.thread().id(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_pinned_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_running(&self) -> bool {
        !self.job_tx.is_closed()
    }

    /// Queues `job` without waiting for it.
    ///
    /// Returns `true` once the job is queued (or, on the pinned thread, once it
    /// ran); the job's own result is not reported. Returns `false` when the
    /// executor no longer accepts jobs.
    pub fn run<F>(&self, job: F) -> bool
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        if self.is_pinned_thread() {
            run_guarded(job);
            return true;
        }
        match self.job_tx.try_send(Box::new(job)) {
            Ok(()) => true,
            Err(e) => {
                debug!("executor {} refused job: {}", self.name, e);
                false
            }
        }
    }

    /// Queues `job` and blocks the calling thread until it finished or
    /// `timeout` elapsed.
    ///
    /// Returns the job's result, or `false` on timeout or when the job could
    /// not be queued. Calling this from inside an async task blocks that
    /// runtime worker; async callers use `run_and_wait_async`.
    pub fn run_and_wait<F>(&self, job: F, timeout: Duration) -> bool
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        if self.is_pinned_thread() {
            return run_guarded(job);
        }
        let completion = Arc::new(Completion::default());
        let signal = completion.clone();
        let queued = self.job_tx.try_send(Box::new(move || {
            let result = run_guarded(job);
            signal.complete(result);
            result
        }));
        if queued.is_err() {
            debug!("executor {} refused job", self.name);
            return false;
        }
        match completion.wait(timeout) {
            Some(result) => result,
            None => {
                trace!("executor {} job timed out after {:?}", self.name, timeout);
                false
            }
        }
    }

    /// Same contract as `run_and_wait`, but the caller's task yields to its
    /// runtime while waiting instead of blocking the thread.
    pub async fn run_and_wait_async<F>(&self, job: F, timeout: Duration) -> bool
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        if self.is_pinned_thread() {
            return run_guarded(job);
        }
        let (result_tx, result_rx) = oneshot::channel();
        let queued = self.job_tx.try_send(Box::new(move || {
            let result = run_guarded(job);
            let _ = result_tx.send(result);
            result
        }));
        if queued.is_err() {
            debug!("executor {} refused job", self.name);
            return false;
        }
        match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => false,
            Err(_) => {
                trace!("executor {} job timed out after {:?}", self.name, timeout);
                false
            }
        }
    }

    /// Stops accepting jobs. Jobs already queued still run.
    pub fn shutdown(&self) {
        self.job_tx.close();
    }
}

impl Drop for AsyncExecutor {
    fn drop(&mut self) {
        self.job_tx.close();
        debug!("executor {} dropped", self.name);
    }
}
