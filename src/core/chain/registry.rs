// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process-wide cache of chain stores, keyed by tenant id.
//!
//! The registry is the sole owner of [`ChainStore`] instances; every
//! other component borrows `Arc` references through it. First access
//! loads the tenant's snapshot lazily. An LRU policy bounded by
//! `chain_cache_memory_limit` evicts least-recently-used stores, but a
//! dirty store is skipped until its debounced save has fired; when the
//! clean candidates alone cannot get under the ceiling, the oldest
//! dirty store is flushed synchronously (waiting on any in-flight save)
//! and then evicted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::core::chain::chain_store::{ChainStore, LoadOutcome};
use crate::core::config::EngineConfig;
use crate::core::error::{MarkovError, MarkovResult};

struct StoreSlot {
    store: Arc<ChainStore>,
    last_used: u64,
}

struct RegistryInner {
    stores: HashMap<String, StoreSlot>,
    tick: u64,
}

/// Cache of per-tenant chain stores with lazy load and LRU eviction.
pub struct StoreRegistry {
    config: Arc<EngineConfig>,
    inner: Mutex<RegistryInner>,
}

impl StoreRegistry {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            inner: Mutex::new(RegistryInner {
                stores: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Fetch the store for `tenant_id`, creating and loading it on
    /// first access. A tenant without a snapshot starts empty.
    pub fn get(&self, tenant_id: &str) -> MarkovResult<Arc<ChainStore>> {
        self.fetch(tenant_id, false)
    }

    /// Fetch the store for `tenant_id` only if a snapshot exists on
    /// disk. Used by read-only paths that must not create tenants.
    pub fn open_existing(&self, tenant_id: &str) -> MarkovResult<Arc<ChainStore>> {
        self.fetch(tenant_id, true)
    }

    fn fetch(&self, tenant_id: &str, require_snapshot: bool) -> MarkovResult<Arc<ChainStore>> {
        if tenant_id.is_empty() {
            return Err(MarkovError::invalid_input_for(
                "tenant id must not be empty",
                "tenant_id",
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(slot) = inner.stores.get_mut(tenant_id) {
            slot.last_used = tick;
            return Ok(Arc::clone(&slot.store));
        }

        let store = ChainStore::new(tenant_id, &self.config);
        let outcome = store.load();
        if require_snapshot && outcome == LoadOutcome::Missing {
            return Err(MarkovError::not_found(format!(
                "tenant '{tenant_id}' has no snapshot"
            )));
        }

        inner.stores.insert(
            tenant_id.to_string(),
            StoreSlot {
                store: Arc::clone(&store),
                last_used: tick,
            },
        );
        self.enforce_memory_limit(&mut inner);
        Ok(store)
    }

    /// Evict stores until the estimated footprint fits the ceiling.
    ///
    /// Clean stores go first, oldest access first. If those are not
    /// enough, dirty stores are force-flushed and evicted in the same
    /// order. The just-used store (highest tick) is never considered.
    fn enforce_memory_limit(&self, inner: &mut RegistryInner) {
        let limit = self.config.chain_cache_memory_limit;

        let mut total: u64 = inner
            .stores
            .values()
            .map(|slot| slot.store.stats().approx_memory_bytes)
            .sum();
        if total <= limit {
            return;
        }

        let newest = inner.stores.values().map(|s| s.last_used).max().unwrap_or(0);
        let mut candidates: Vec<(String, u64, bool)> = inner
            .stores
            .iter()
            .filter(|(_, slot)| slot.last_used != newest)
            .map(|(id, slot)| (id.clone(), slot.last_used, slot.store.is_dirty()))
            .collect();
        // clean before dirty, then oldest first
        candidates.sort_by_key(|(_, last_used, dirty)| (*dirty, *last_used));

        for (tenant_id, _, dirty) in candidates {
            if total <= limit {
                break;
            }
            if let Some(slot) = inner.stores.remove(&tenant_id) {
                let bytes = slot.store.stats().approx_memory_bytes;
                if dirty {
                    if let Err(e) = slot.store.flush() {
                        log::error!("tenant '{tenant_id}': flush before eviction failed: {e}");
                        inner.stores.insert(tenant_id, slot);
                        continue;
                    }
                }
                total = total.saturating_sub(bytes);
                log::info!("evicted tenant '{tenant_id}' from chain cache ({bytes} bytes)");
            }
        }
    }

    /// Drop one tenant's store from the cache. A dirty store is flushed
    /// by its `Drop` once the last borrower releases it.
    pub fn evict(&self, tenant_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .stores
            .remove(tenant_id)
            .is_some()
    }

    /// Tenants currently cached
    pub fn loaded_tenants(&self) -> Vec<String> {
        self.inner.lock().unwrap().stores.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush every dirty store. Failures are collected per tenant, not
    /// short-circuited.
    pub fn flush_all(&self) -> Vec<(String, MarkovError)> {
        let stores: Vec<Arc<ChainStore>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .stores
                .values()
                .map(|slot| Arc::clone(&slot.store))
                .collect()
        };

        let mut failures = Vec::new();
        for store in stores {
            if let Err(e) = store.flush() {
                failures.push((store.tenant_id().to_string(), e));
            }
        }
        failures
    }

    /// Flush and drop every store.
    pub fn shutdown(&self) {
        for (tenant_id, error) in self.flush_all() {
            log::error!("tenant '{tenant_id}': flush during shutdown failed: {error}");
        }
        self.inner.lock().unwrap().stores.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry(dir: &std::path::Path, memory_limit: u64) -> StoreRegistry {
        StoreRegistry::new(Arc::new(EngineConfig {
            data_dir: dir.to_path_buf(),
            config_dir: dir.to_path_buf(),
            chain_cache_memory_limit: memory_limit,
            save_debounce: Duration::from_millis(60_000),
            ..EngineConfig::default()
        }))
    }

    #[test]
    fn test_get_creates_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), u64::MAX);
        let store = registry.get("guild-1").unwrap();
        assert_eq!(store.stats().prefix_count, 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_returns_same_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), u64::MAX);
        let a = registry.get("guild-1").unwrap();
        let b = registry.get("guild-1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_empty_tenant_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), u64::MAX);
        assert!(matches!(
            registry.get(""),
            Err(MarkovError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_open_existing_requires_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), u64::MAX);
        assert!(matches!(
            registry.open_existing("ghost"),
            Err(MarkovError::NotFound { .. })
        ));

        // create and persist, then reopen through a fresh registry
        registry.get("real").unwrap().add_record("a b", "c", 1).unwrap();
        registry.get("real").unwrap().save().unwrap();
        let fresh = StoreRegistry::new(Arc::new(EngineConfig {
            data_dir: dir.path().to_path_buf(),
            config_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        }));
        assert!(fresh.open_existing("real").is_ok());
    }

    #[test]
    fn test_lru_evicts_clean_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        // tiny ceiling: every store exceeds it on its own
        let registry = registry(dir.path(), 1);

        registry.get("old").unwrap();
        registry.get("new").unwrap();

        let loaded = registry.loaded_tenants();
        assert!(loaded.contains(&"new".to_string()));
        assert!(!loaded.contains(&"old".to_string()));
    }

    #[test]
    fn test_eviction_flushes_dirty_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 1);

        registry
            .get("dirty")
            .unwrap()
            .add_record("a b", "c", 1)
            .unwrap();
        registry.get("other").unwrap();

        // the dirty store was flushed before eviction
        let path = crate::core::persistence::snapshot_path(dir.path(), "dirty");
        assert!(path.exists());
    }

    #[test]
    fn test_shutdown_flushes_dirty_stores() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), u64::MAX);
        registry
            .get("guild-1")
            .unwrap()
            .add_record("a b", "c", 1)
            .unwrap();
        registry.shutdown();

        let path = crate::core::persistence::snapshot_path(dir.path(), "guild-1");
        assert!(path.exists());
        assert!(registry.is_empty());
    }
}
