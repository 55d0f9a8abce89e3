// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine handle wiring the store registry and the worker pool.
//!
//! Constructed once at startup and shared (by `Arc` or reference) with
//! every collaborator; there are no process-wide singletons. The
//! adapter's request path reads synchronously through the registry and
//! dispatches CPU-bound work to the pool via the `*_async` methods,
//! each returning a single-shot [`TaskHandle`].

use std::sync::Arc;

use crate::core::chain::{StoreRegistry, StoreStats, TrainingRecord};
use crate::core::config::{EngineConfig, FlatConfig};
use crate::core::error::MarkovResult;
use crate::core::pool::{
    BatchOperation, TaskHandle, TaskPayload, TaskPriority, WorkerPool,
};
use crate::core::train::TrainBatcher;

/// The generation engine: per-tenant chain stores behind a registry,
/// plus a worker pool keeping chain building off the request path.
pub struct MarkovEngine {
    config: Arc<EngineConfig>,
    registry: Arc<StoreRegistry>,
    pool: Arc<WorkerPool>,
}

impl MarkovEngine {
    pub fn new(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(StoreRegistry::new(Arc::clone(&config)));
        let pool = Arc::new(WorkerPool::new(Arc::clone(&registry), &config));
        Self {
            config,
            registry,
            pool,
        }
    }

    /// Build an engine from layered key-value configuration.
    pub fn from_flat_config(flat: &FlatConfig) -> MarkovResult<Self> {
        Ok(Self::new(EngineConfig::from_flat_config(flat)?))
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    #[inline]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// A batcher bound to this engine's pool and configuration.
    pub fn batcher(&self) -> TrainBatcher {
        TrainBatcher::new(Arc::clone(&self.pool), Arc::clone(&self.config))
    }

    /// Synchronous generation on the caller's thread. The read path
    /// only samples; alias rebuilds are amortized per prefix.
    pub fn generate(&self, tenant_id: &str, seed: &str, max_len: usize) -> MarkovResult<Vec<String>> {
        Ok(self.registry.get(tenant_id)?.generate(seed, max_len))
    }

    /// Synchronous store statistics.
    pub fn stats(&self, tenant_id: &str) -> MarkovResult<StoreStats> {
        Ok(self.registry.get(tenant_id)?.stats())
    }

    /// Dispatch a generation to the pool at high priority.
    pub fn generate_async(
        &self,
        tenant_id: &str,
        seed: &str,
        max_len: usize,
    ) -> MarkovResult<TaskHandle> {
        self.pool.submit(
            TaskPayload::GenerateResponse {
                tenant_id: tenant_id.to_string(),
                seed: seed.to_string(),
                max_len,
                temperature: None,
            },
            TaskPriority::High,
        )
    }

    /// Dispatch a bulk build to the pool at normal priority.
    pub fn build_chains_async(
        &self,
        tenant_id: &str,
        records: Vec<TrainingRecord>,
        clear_existing: bool,
    ) -> MarkovResult<TaskHandle> {
        self.pool.submit(
            TaskPayload::BuildChains {
                tenant_id: tenant_id.to_string(),
                records,
                clear_existing,
            },
            TaskPriority::Normal,
        )
    }

    /// Dispatch a mutation batch at the given priority.
    pub fn batch_update_async(
        &self,
        tenant_id: &str,
        operation: BatchOperation,
        priority: TaskPriority,
    ) -> MarkovResult<TaskHandle> {
        self.pool.submit(
            TaskPayload::BatchUpdate {
                tenant_id: tenant_id.to_string(),
                operation,
            },
            priority,
        )
    }

    /// Dispatch a statistics read at low priority.
    pub fn stats_async(&self, tenant_id: &str) -> MarkovResult<TaskHandle> {
        self.pool.submit(
            TaskPayload::Stats {
                tenant_id: tenant_id.to_string(),
            },
            TaskPriority::Low,
        )
    }

    /// Orderly teardown: drain the pool, then flush every dirty store.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.registry.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine(dir: &std::path::Path) -> MarkovEngine {
        MarkovEngine::new(EngineConfig {
            data_dir: dir.to_path_buf(),
            config_dir: dir.to_path_buf(),
            worker_pool_size: 2,
            save_debounce: Duration::from_millis(60_000),
            ..EngineConfig::default()
        })
    }

    #[test]
    fn test_build_and_generate_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        engine
            .build_chains_async(
                "guild-1",
                vec![
                    TrainingRecord::new("a b", "c", 1),
                    TrainingRecord::new("b c", "d", 1),
                ],
                false,
            )
            .unwrap()
            .wait()
            .unwrap();

        let tokens = engine.generate("guild-1", "a b", 10).unwrap();
        assert_eq!(tokens, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_stats_async_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .build_chains_async(
                "guild-1",
                vec![TrainingRecord::new("a b", "c", 1)],
                false,
            )
            .unwrap()
            .wait()
            .unwrap();

        let handle = engine.stats_async("guild-1").unwrap();
        match handle.wait().unwrap() {
            crate::core::pool::TaskOutput::Stats(stats) => {
                assert_eq!(stats.prefix_count, 1);
                assert_eq!(stats.total_suffixes, 1);
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_shutdown_flushes_stores() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .build_chains_async(
                "guild-1",
                vec![TrainingRecord::new("a b", "c", 1)],
                false,
            )
            .unwrap()
            .wait()
            .unwrap();
        engine.shutdown();

        let path = crate::core::persistence::snapshot_path(dir.path(), "guild-1");
        assert!(path.exists());
    }
}
