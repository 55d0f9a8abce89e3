// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-tenant chain store.
//!
//! The store guards its prefix mapping with a single-writer /
//! multi-reader lock. Training acquires write, generation acquires
//! read, and the lazy alias rebuild inside sampling upgrades by
//! releasing the read lock, re-checking under the write lock and
//! sampling under a fresh read lock. Mutations mark the store dirty and
//! re-arm a debounced snapshot save; the pending timer holds only a
//! weak handle, so an evicted store never lingers because of it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use rand::prelude::IteratorRandom;
use serde::{Deserialize, Serialize};

use crate::core::chain::prefix_entry::PrefixEntry;
use crate::core::config::EngineConfig;
use crate::core::error::{MarkovError, MarkovResult};
use crate::core::persistence::{
    load_snapshot, snapshot_path, write_snapshot, ChainRecord, Debouncer, SnapshotFile,
};

/// Normalized training observation: `suffix` was seen following
/// `prefix`, `weight` times.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrainingRecord {
    pub prefix: String,
    pub suffix: String,
    pub weight: u64,
}

impl TrainingRecord {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>, weight: u64) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            weight,
        }
    }
}

/// Store size summary
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreStats {
    pub prefix_count: usize,
    pub total_suffixes: usize,
    pub approx_memory_bytes: u64,
}

/// Result of a batch insertion. Per-record failures are accumulated
/// here; they never abort the rest of the batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub inserted: usize,
    pub errors: Vec<(usize, MarkovError)>,
}

/// Outcome of populating a store from disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Snapshot read and applied
    Loaded,
    /// No snapshot on disk; store starts empty
    Missing,
    /// Snapshot unreadable or corrupt; store starts empty, file kept
    Recovered,
}

/// One tenant's Markov chains plus their persistence state.
pub struct ChainStore {
    tenant_id: String,
    state_size: AtomicUsize,
    eol_token: String,
    path: PathBuf,
    chains: RwLock<HashMap<String, PrefixEntry>>,
    dirty: AtomicBool,
    snapshot_version: AtomicU64,
    /// Held for the whole of `save()`; forced evictions synchronize on
    /// an in-flight save by taking it.
    save_lock: Mutex<()>,
    debouncer: Debouncer,
    self_ref: Mutex<Weak<ChainStore>>,
}

impl std::fmt::Debug for ChainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStore")
            .field("tenant_id", &self.tenant_id)
            .field("state_size", &self.state_size.load(Ordering::Relaxed))
            .field("prefixes", &self.chains.read().unwrap().len())
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .field(
                "snapshot_version",
                &self.snapshot_version.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl ChainStore {
    /// Create an empty store for `tenant_id`. Does not touch the disk;
    /// call [`ChainStore::load`] to populate from a snapshot.
    pub fn new(tenant_id: impl Into<String>, config: &EngineConfig) -> Arc<Self> {
        let tenant_id = tenant_id.into();
        let store = Arc::new(Self {
            path: snapshot_path(&config.data_dir, &tenant_id),
            tenant_id,
            state_size: AtomicUsize::new(config.state_size),
            eol_token: config.eol_token.clone(),
            chains: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            snapshot_version: AtomicU64::new(0),
            save_lock: Mutex::new(()),
            debouncer: Debouncer::new(config.save_debounce),
            self_ref: Mutex::new(Weak::new()),
        });
        *store.self_ref.lock().unwrap() = Arc::downgrade(&store);
        store
    }

    #[inline]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    #[inline]
    pub fn state_size(&self) -> usize {
        self.state_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version.load(Ordering::Relaxed)
    }

    /// Populate the store from its snapshot file.
    ///
    /// A missing file means a brand-new tenant. An unreadable or
    /// corrupt file is logged and left on disk for operator
    /// intervention; the store starts empty in that case.
    pub fn load(&self) -> LoadOutcome {
        let snapshot = match load_snapshot(&self.path) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return LoadOutcome::Missing,
            Err(e) => {
                log::warn!(
                    "tenant '{}': starting empty, snapshot unusable: {e}",
                    self.tenant_id
                );
                return LoadOutcome::Recovered;
            }
        };

        if snapshot.state_size != self.state_size() {
            log::warn!(
                "tenant '{}': snapshot carries state size {} (configured {}), keeping the snapshot's",
                self.tenant_id,
                snapshot.state_size,
                self.state_size()
            );
            self.state_size.store(snapshot.state_size, Ordering::Relaxed);
        }

        let mut chains = self.chains.write().unwrap();
        chains.clear();
        for (prefix, record) in snapshot.chains {
            match PrefixEntry::from_suffixes(prefix.clone(), record.suffixes) {
                Ok(entry) => {
                    chains.insert(prefix, entry);
                }
                Err(e) => {
                    log::warn!(
                        "tenant '{}': dropping malformed chain record '{prefix}': {e}",
                        self.tenant_id
                    );
                }
            }
        }
        drop(chains);

        self.snapshot_version.store(1, Ordering::Relaxed);
        log::info!(
            "tenant '{}': loaded snapshot ({} prefixes)",
            self.tenant_id,
            self.chains.read().unwrap().len()
        );
        LoadOutcome::Loaded
    }

    fn validate_record(&self, prefix: &str, suffix: &str, weight: u64) -> MarkovResult<()> {
        if weight == 0 {
            return Err(MarkovError::invalid_input_for(
                "record weight must be >= 1",
                "weight",
            ));
        }
        let expected = self.state_size();
        let got = prefix.split_whitespace().count();
        if got != expected {
            return Err(MarkovError::invalid_input_for(
                format!("prefix must contain exactly {expected} tokens, got {got}"),
                "prefix",
            ));
        }
        if suffix.is_empty() || (suffix != self.eol_token && suffix.chars().any(char::is_whitespace))
        {
            return Err(MarkovError::invalid_input_for(
                "suffix must be a single non-empty token",
                "suffix",
            ));
        }
        Ok(())
    }

    /// Record one (prefix, suffix, weight) observation.
    pub fn add_record(&self, prefix: &str, suffix: &str, weight: u64) -> MarkovResult<()> {
        self.validate_record(prefix, suffix, weight)?;
        {
            let mut chains = self.chains.write().unwrap();
            let entry = chains
                .entry(prefix.to_string())
                .or_insert_with(|| PrefixEntry::new(prefix));
            entry.insert(suffix, weight)?;
        }
        self.mark_dirty();
        Ok(())
    }

    /// Insert a batch of records under one write acquisition.
    ///
    /// Invalid records are reported per index in the returned
    /// [`BatchReport`] and do not abort the batch. The save debounce is
    /// armed once for the whole batch.
    pub fn add_batch(&self, records: &[TrainingRecord]) -> BatchReport {
        let mut report = BatchReport::default();
        {
            let mut chains = self.chains.write().unwrap();
            for (i, record) in records.iter().enumerate() {
                if let Err(e) = self.validate_record(&record.prefix, &record.suffix, record.weight)
                {
                    report.errors.push((i, e));
                    continue;
                }
                let entry = chains
                    .entry(record.prefix.clone())
                    .or_insert_with(|| PrefixEntry::new(record.prefix.as_str()));
                match entry.insert(&record.suffix, record.weight) {
                    Ok(()) => report.inserted += 1,
                    Err(e) => report.errors.push((i, e)),
                }
            }
        }
        if report.inserted > 0 {
            self.mark_dirty();
        }
        report
    }

    /// Sample the next token after `prefix`, or `None` for an unknown
    /// prefix or an empty entry.
    pub fn get_next(&self, prefix: &str) -> Option<String> {
        {
            let chains = self.chains.read().unwrap();
            let entry = chains.get(prefix)?;
            if !entry.needs_alias_build() {
                let mut rng = rand::rng();
                return entry.sample(&mut rng).map(str::to_string);
            }
        }

        // Stale alias table: upgrade to write, double-check, rebuild.
        {
            let mut chains = self.chains.write().unwrap();
            if let Some(entry) = chains.get_mut(prefix) {
                if entry.needs_alias_build() {
                    if let Err(e) = entry.build_alias() {
                        log::error!(
                            "tenant '{}': alias rebuild failed for '{prefix}': {e}",
                            self.tenant_id
                        );
                    }
                }
            }
        }

        let chains = self.chains.read().unwrap();
        let entry = chains.get(prefix)?;
        let mut rng = rand::rng();
        entry.sample(&mut rng).map(str::to_string)
    }

    /// Walk the chain from a seed prefix.
    ///
    /// Appends sampled tokens until a dead end, the end-of-line
    /// sentinel, or `max_len` total tokens. The returned sequence
    /// includes the seed tokens; the sentinel is never included.
    pub fn generate(&self, seed: &str, max_len: usize) -> Vec<String> {
        let mut output: Vec<String> = seed.split_whitespace().map(str::to_string).collect();
        let state_size = self.state_size();

        while output.len() < max_len {
            if output.is_empty() {
                break;
            }
            let start = output.len().saturating_sub(state_size);
            let prefix = output[start..].join(" ");
            match self.get_next(&prefix) {
                Some(token) if token != self.eol_token => output.push(token),
                _ => break,
            }
        }
        output
    }

    /// A uniformly chosen known prefix, for seeding a generation when
    /// the caller has none.
    pub fn random_seed(&self) -> Option<String> {
        let chains = self.chains.read().unwrap();
        chains.keys().choose(&mut rand::rng()).cloned()
    }

    /// Drop every chain. The now-empty store is persisted on the next
    /// debounce fire.
    pub fn clear(&self) {
        self.chains.write().unwrap().clear();
        self.mark_dirty();
    }

    /// Remove one prefix and its suffixes. Returns whether it existed.
    pub fn remove_prefix(&self, prefix: &str) -> bool {
        let removed = self.chains.write().unwrap().remove(prefix).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn stats(&self) -> StoreStats {
        let chains = self.chains.read().unwrap();
        let mut total_suffixes = 0usize;
        let mut approx_memory_bytes = 0u64;
        for (prefix, entry) in chains.iter() {
            total_suffixes += entry.len();
            approx_memory_bytes += prefix.len() as u64 + entry.approx_memory_bytes();
        }
        StoreStats {
            prefix_count: chains.len(),
            total_suffixes,
            approx_memory_bytes,
        }
    }

    /// Every (prefix, suffix, weight) triple in deterministic order:
    /// prefixes sorted, suffixes in insertion order. The inverse of
    /// [`ChainStore::add_batch`].
    pub fn export_records(&self) -> Vec<TrainingRecord> {
        let chains = self.chains.read().unwrap();
        let mut prefixes: Vec<&String> = chains.keys().collect();
        prefixes.sort();

        let mut records = Vec::new();
        for prefix in prefixes {
            let entry = &chains[prefix];
            for suffix in entry.enumerate() {
                records.push(TrainingRecord::new(
                    prefix.clone(),
                    suffix.word.clone(),
                    suffix.weight,
                ));
            }
        }
        records
    }

    /// Serialize and write the snapshot now.
    ///
    /// Serialization happens under a read acquisition of the prefix
    /// map, so training may proceed as soon as the in-memory copy is
    /// taken. Rename semantics guarantee partial writes never replace a
    /// good snapshot.
    pub fn save(&self) -> MarkovResult<()> {
        let _in_flight = self.save_lock.lock().unwrap();

        let mut snapshot = SnapshotFile::new(self.tenant_id.clone(), self.state_size());
        {
            let chains = self.chains.read().unwrap();
            let mut out = BTreeMap::new();
            for (prefix, entry) in chains.iter() {
                out.insert(
                    prefix.clone(),
                    ChainRecord {
                        prefix: prefix.clone(),
                        suffixes: entry.enumerate().cloned().collect(),
                        total_weight: entry.total_weight(),
                    },
                );
            }
            snapshot.chains = out;
        }

        write_snapshot(&self.path, &snapshot)?;
        self.dirty.store(false, Ordering::SeqCst);
        let version = self.snapshot_version.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!(
            "tenant '{}': snapshot v{version} written ({} prefixes)",
            self.tenant_id,
            snapshot.chains.len()
        );
        Ok(())
    }

    /// Synchronous flush: save only when dirty. Waits on an in-flight
    /// debounced save rather than racing it.
    pub fn flush(&self) -> MarkovResult<()> {
        if self.is_dirty() {
            self.save()?;
        }
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        let weak = self.self_ref.lock().unwrap().clone();
        self.debouncer.arm(move || {
            if let Some(store) = weak.upgrade() {
                if store.is_dirty() {
                    if let Err(e) = store.save() {
                        log::error!(
                            "tenant '{}': debounced save failed: {e}",
                            store.tenant_id()
                        );
                    }
                }
            }
        });
    }
}

impl Drop for ChainStore {
    fn drop(&mut self) {
        if self.is_dirty() {
            if let Err(e) = self.save() {
                log::error!(
                    "tenant '{}': final flush on drop failed: {e}",
                    self.tenant_id
                );
            }
        }
    }
}
