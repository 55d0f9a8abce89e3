// SPDX-License-Identifier: MIT OR Apache-2.0

//! Task types for the worker pool.
//!
//! Tasks are a closed sum of variants, each carrying its typed payload.
//! Every submission gets a dedicated task id used for routing and
//! logging; pool slot numbers are labels only and never key any state.
//! Results travel on a per-task channel owned by the [`TaskHandle`], so
//! two tasks can never collect each other's results.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use uuid::Uuid;

use crate::core::chain::{StoreStats, TrainingRecord};
use crate::core::error::{MarkovError, MarkovResult};

/// Scheduling priority. Ties inside one level are served in submission
/// order, so equal-priority requests cannot starve each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
}

/// Mutation flavor of a `BatchUpdate` task
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Merge the records into the tenant's chains
    Add(Vec<TrainingRecord>),
    /// Remove the named prefixes outright
    Remove(Vec<String>),
}

/// Work the pool knows how to execute
#[derive(Debug, Clone)]
pub enum TaskPayload {
    /// Bulk-insert training records, optionally clearing the tenant first
    BuildChains {
        tenant_id: String,
        records: Vec<TrainingRecord>,
        clear_existing: bool,
    },
    /// Produce one generation. `temperature` is reserved: it is
    /// validated when present but the weight-proportional sampler
    /// ignores it.
    GenerateResponse {
        tenant_id: String,
        seed: String,
        max_len: usize,
        temperature: Option<f64>,
    },
    /// Apply a mutation batch and schedule a save
    BatchUpdate {
        tenant_id: String,
        operation: BatchOperation,
    },
    /// Report store statistics
    Stats { tenant_id: String },
}

impl TaskPayload {
    /// Tenant the task operates on
    pub fn tenant_id(&self) -> &str {
        match self {
            TaskPayload::BuildChains { tenant_id, .. }
            | TaskPayload::GenerateResponse { tenant_id, .. }
            | TaskPayload::BatchUpdate { tenant_id, .. }
            | TaskPayload::Stats { tenant_id } => tenant_id,
        }
    }

    /// Short kind label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::BuildChains { .. } => "build-chains",
            TaskPayload::GenerateResponse { .. } => "generate-response",
            TaskPayload::BatchUpdate { .. } => "batch-update",
            TaskPayload::Stats { .. } => "stats",
        }
    }
}

/// Typed result of a completed task
#[derive(Debug, Clone)]
pub enum TaskOutput {
    ChainsBuilt { processed_count: usize },
    Generated { tokens: Vec<String> },
    Updated { update_count: usize },
    Stats(StoreStats),
}

/// A task sitting in (or popped from) the pool queue
pub(crate) struct QueuedTask {
    pub id: Uuid,
    pub priority: TaskPriority,
    pub seq: u64,
    pub payload: TaskPayload,
    pub result_tx: Sender<MarkovResult<TaskOutput>>,
    pub cancelled: Arc<AtomicBool>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    /// Max-heap order: higher priority first, then earlier submission.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Single-shot handle on a submitted task.
///
/// Blocking contexts call [`TaskHandle::wait`]; event-loop hosts poll
/// [`TaskHandle::try_wait`] or park a thread on it. The handle owns the
/// receiving side of the task's result channel.
#[derive(Debug)]
pub struct TaskHandle {
    id: Uuid,
    rx: Receiver<MarkovResult<TaskOutput>>,
    cancelled: Arc<AtomicBool>,
    pool_shutdown: Arc<AtomicBool>,
}

impl TaskHandle {
    pub(crate) fn new(
        id: Uuid,
        rx: Receiver<MarkovResult<TaskOutput>>,
        cancelled: Arc<AtomicBool>,
        pool_shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            rx,
            cancelled,
            pool_shutdown,
        }
    }

    /// Routing id of the underlying task
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation. Only effective while the task is still
    /// queued; a dispatched task runs to completion and its result is
    /// delivered as usual.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Block until the task resolves.
    pub fn wait(&self) -> MarkovResult<TaskOutput> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Block up to `timeout`. `None` means the task has not resolved
    /// yet; the result stays claimable.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<MarkovResult<TaskOutput>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(self.closed_error())),
        }
    }

    /// Non-blocking poll.
    pub fn try_wait(&self) -> Option<MarkovResult<TaskOutput>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.closed_error())),
        }
    }

    /// Classify a closed result channel: cancellation and shutdown are
    /// expected, anything else means the executing worker died.
    fn closed_error(&self) -> MarkovError {
        if self.cancelled.load(Ordering::SeqCst) {
            MarkovError::cancelled(format!("task {} cancelled before dispatch", self.id))
        } else if self.pool_shutdown.load(Ordering::SeqCst) {
            MarkovError::cancelled(format!("pool shut down while task {} was queued", self.id))
        } else {
            MarkovError::worker(format!(
                "worker terminated before returning a result for task {}",
                self.id
            ))
        }
    }
}
