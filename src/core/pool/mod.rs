// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod task;
pub mod worker_pool;

pub use self::task::{BatchOperation, TaskHandle, TaskOutput, TaskPayload, TaskPriority};
pub use self::worker_pool::{PoolStats, WorkerPool};
