// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-size worker pool for CPU-bound chain work.
//!
//! The request path never builds chains itself; it submits tasks here
//! and awaits the returned handle. A single shared priority queue feeds
//! all workers: the dispatcher (each idle worker) pops the
//! highest-priority task, ties broken by submission order. Task
//! execution is panic-isolated, so a failing task reports an error
//! without costing a worker; a worker that dies anyway is replaced by
//! the supervisor after a short backoff.

use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use uuid::Uuid;

use crate::core::chain::StoreRegistry;
use crate::core::config::EngineConfig;
use crate::core::error::{MarkovError, MarkovResult};
use crate::core::pool::task::{
    BatchOperation, QueuedTask, TaskHandle, TaskOutput, TaskPayload, TaskPriority,
};

/// Delay before a crashed worker slot is refilled
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Pool occupancy snapshot, for caller-side backpressure
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
}

struct WorkerExit {
    slot: usize,
    panicked: bool,
}

/// Worker-count bookkeeping: readiness at startup, liveness at shutdown.
struct WorkerCensus {
    live: Mutex<usize>,
    changed: Condvar,
}

impl WorkerCensus {
    fn new() -> Self {
        Self {
            live: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    fn arrive(&self) {
        *self.live.lock().unwrap() += 1;
        self.changed.notify_all();
    }

    fn depart(&self) {
        *self.live.lock().unwrap() -= 1;
        self.changed.notify_all();
    }

    fn wait_for(&self, target: usize, deadline: Instant) -> usize {
        let mut live = self.live.lock().unwrap();
        while *live != target {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self.changed.wait_timeout(live, deadline - now).unwrap();
            live = guard;
        }
        *live
    }
}

struct PoolShared {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    task_available: Condvar,
    shutdown: Arc<AtomicBool>,
    seq: AtomicU64,
    busy: AtomicUsize,
    census: WorkerCensus,
    exit_tx: Sender<WorkerExit>,
    registry: Arc<StoreRegistry>,
}

/// Fixed set of workers draining one shared, priority-ordered queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    supervisor: Mutex<Option<thread::JoinHandle<()>>>,
    size: usize,
    grace: Duration,
}

impl WorkerPool {
    /// Spawn `config.worker_pool_size` workers plus the supervisor, and
    /// wait for every worker to signal readiness.
    pub fn new(registry: Arc<StoreRegistry>, config: &EngineConfig) -> Self {
        let size = config.worker_pool_size.max(1);
        let (exit_tx, exit_rx) = unbounded();

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(BinaryHeap::new()),
            task_available: Condvar::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            seq: AtomicU64::new(0),
            busy: AtomicUsize::new(0),
            census: WorkerCensus::new(),
            exit_tx,
            registry,
        });

        for slot in 0..size {
            spawn_worker(Arc::clone(&shared), slot);
        }
        let ready = shared
            .census
            .wait_for(size, Instant::now() + Duration::from_secs(5));
        if ready != size {
            log::warn!("only {ready}/{size} workers signalled readiness in time");
        }

        let supervisor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("markov-pool-supervisor".to_string())
                .spawn(move || supervisor_loop(shared, exit_rx))
                .ok()
        };

        log::info!("worker pool started ({size} workers)");
        Self {
            shared,
            supervisor: Mutex::new(supervisor),
            size,
            grace: config.graceful_shutdown,
        }
    }

    /// Queue a task. Returns the handle its result arrives on.
    ///
    /// # Errors
    /// [`MarkovError::Cancelled`] once the pool has been shut down.
    pub fn submit(&self, payload: TaskPayload, priority: TaskPriority) -> MarkovResult<TaskHandle> {
        let id = Uuid::new_v4();
        let (result_tx, result_rx) = crossbeam::channel::bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));

        {
            let mut queue = self.shared.queue.lock().unwrap();
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(MarkovError::cancelled("pool is shut down"));
            }
            let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst);
            log::debug!(
                "task {id} queued ({}, tenant '{}', priority {priority:?})",
                payload.kind(),
                payload.tenant_id()
            );
            queue.push(QueuedTask {
                id,
                priority,
                seq,
                payload,
                result_tx,
                cancelled: Arc::clone(&cancelled),
            });
        }
        self.shared.task_available.notify_one();

        Ok(TaskHandle::new(
            id,
            result_rx,
            cancelled,
            Arc::clone(&self.shared.shutdown),
        ))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.size,
            busy: self.shared.busy.load(Ordering::Relaxed),
            queued: self.shared.queue.lock().unwrap().len(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the pool: queued-but-undispatched tasks resolve as
    /// `Cancelled`, in-flight tasks run to completion, and workers get
    /// the configured grace period before being abandoned.
    pub fn shutdown(&self) {
        let drained: Vec<QueuedTask> = {
            let mut queue = self.shared.queue.lock().unwrap();
            if self.shared.shutdown.swap(true, Ordering::SeqCst) {
                return;
            }
            queue.drain().collect()
        };
        self.shared.task_available.notify_all();

        for task in drained {
            let _ = task.result_tx.send(Err(MarkovError::cancelled(format!(
                "pool shut down before task {} was dispatched",
                task.id
            ))));
        }

        let deadline = Instant::now() + self.grace;
        let stragglers = self.shared.census.wait_for(0, deadline);
        if stragglers > 0 {
            log::warn!("{stragglers} worker(s) still running after shutdown grace; abandoning");
        }

        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            let _ = handle.join();
        }
        log::info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(shared: Arc<PoolShared>, slot: usize) {
    let spawned = thread::Builder::new()
        .name(format!("markov-worker-{slot}"))
        .spawn(move || {
            let _guard = WorkerGuard {
                slot,
                shared: Arc::clone(&shared),
            };
            shared.census.arrive();
            log::debug!("worker {slot} ready");
            worker_loop(&shared);
        });
    if let Err(e) = spawned {
        log::error!("failed to spawn worker {slot}: {e}");
    }
}

/// Announces the worker's death to the supervisor, whether the loop
/// returned normally or unwound.
struct WorkerGuard {
    slot: usize,
    shared: Arc<PoolShared>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.shared.census.depart();
        let _ = self.shared.exit_tx.send(WorkerExit {
            slot: self.slot,
            panicked: thread::panicking(),
        });
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(task) = queue.pop() {
                    break task;
                }
                queue = shared.task_available.wait(queue).unwrap();
            }
        };

        if task.cancelled.load(Ordering::SeqCst) {
            let _ = task.result_tx.send(Err(MarkovError::cancelled(format!(
                "task {} cancelled before dispatch",
                task.id
            ))));
            continue;
        }

        let QueuedTask {
            id,
            payload,
            result_tx,
            ..
        } = task;
        let kind = payload.kind();

        shared.busy.fetch_add(1, Ordering::SeqCst);
        let registry = Arc::clone(&shared.registry);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute_task(&registry, payload)));
        shared.busy.fetch_sub(1, Ordering::SeqCst);

        let result = match outcome {
            Ok(result) => result,
            Err(cause) => {
                let message = panic_message(&cause);
                log::error!("task {id} ({kind}) panicked: {message}");
                Err(MarkovError::worker(format!("task panicked: {message}")))
            }
        };
        if let Err(e) = &result {
            log::warn!("task {id} ({kind}) failed: {e}");
        }
        let _ = result_tx.send(result);
    }
}

fn execute_task(registry: &StoreRegistry, payload: TaskPayload) -> MarkovResult<TaskOutput> {
    match payload {
        TaskPayload::BuildChains {
            tenant_id,
            records,
            clear_existing,
        } => {
            let store = registry.get(&tenant_id)?;
            if clear_existing {
                store.clear();
            }
            let report = store.add_batch(&records);
            for (index, error) in &report.errors {
                log::warn!("tenant '{tenant_id}': record {index} rejected: {error}");
            }
            Ok(TaskOutput::ChainsBuilt {
                processed_count: report.inserted,
            })
        }

        TaskPayload::GenerateResponse {
            tenant_id,
            seed,
            max_len,
            temperature,
        } => {
            if let Some(t) = temperature {
                if !t.is_finite() || t <= 0.0 {
                    return Err(MarkovError::invalid_input_for(
                        "temperature must be finite and > 0",
                        "temperature",
                    ));
                }
            }
            let store = registry.get(&tenant_id)?;
            let seed = if seed.trim().is_empty() {
                store.random_seed().unwrap_or_default()
            } else {
                seed
            };
            Ok(TaskOutput::Generated {
                tokens: store.generate(&seed, max_len),
            })
        }

        TaskPayload::BatchUpdate {
            tenant_id,
            operation,
        } => {
            let store = registry.get(&tenant_id)?;
            let update_count = match operation {
                BatchOperation::Add(records) => {
                    let report = store.add_batch(&records);
                    for (index, error) in &report.errors {
                        log::warn!("tenant '{tenant_id}': update {index} rejected: {error}");
                    }
                    report.inserted
                }
                BatchOperation::Remove(prefixes) => prefixes
                    .iter()
                    .filter(|prefix| store.remove_prefix(prefix))
                    .count(),
            };
            Ok(TaskOutput::Updated { update_count })
        }

        TaskPayload::Stats { tenant_id } => {
            let store = registry.get(&tenant_id)?;
            Ok(TaskOutput::Stats(store.stats()))
        }
    }
}

fn supervisor_loop(shared: Arc<PoolShared>, exit_rx: crossbeam::channel::Receiver<WorkerExit>) {
    loop {
        match exit_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(exit) => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    continue;
                }
                if exit.panicked {
                    log::error!(
                        "worker {} terminated unexpectedly; respawning in {:?}",
                        exit.slot,
                        RESPAWN_BACKOFF
                    );
                    thread::sleep(RESPAWN_BACKOFF);
                    if !shared.shutdown.load(Ordering::SeqCst) {
                        spawn_worker(Arc::clone(&shared), exit.slot);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
