pub use async_executor::AsyncExecutor;
pub use worker_pool::{DispatchOrder, PoolHandler, WorkerPool, WorkerPoolConfig};

mod async_executor;
mod worker_pool;
