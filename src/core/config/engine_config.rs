// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Engine Configuration Module
//!
//! Configuration management for the generation engine with multi-layer
//! property resolution. Settings can come from multiple sources and are
//! merged according to their precedence.
//!
//! ## Configuration Sources (Priority: Low to High)
//!
//! 1. **RustDefault** - Built-in Rust defaults
//! 2. **ConfigFile** - Host-supplied configuration file
//! 3. **Override** - Explicit programmatic overrides
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use markovflux::core::config::{EngineConfig, FlatConfig, PropertySource};
//!
//! let mut flat = FlatConfig::new();
//! flat.set("markov.state-size", "3", PropertySource::ConfigFile);
//! flat.set("markov.worker-pool-size", "auto", PropertySource::Override);
//!
//! let config = EngineConfig::from_flat_config(&flat)?;
//! assert_eq!(config.state_size, 3);
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::{MarkovError, MarkovResult};

/// Property source identifier with priority ordering
///
/// Higher priority sources override lower priority sources during
/// configuration merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertySource {
    /// Rust code defaults (priority: 0)
    RustDefault,
    /// Host configuration file (priority: 1)
    ConfigFile,
    /// Explicit programmatic override (priority: 2)
    Override,
}

impl PropertySource {
    /// Get numeric priority for comparison (higher = more important)
    #[inline]
    pub const fn priority(&self) -> u8 {
        match self {
            PropertySource::RustDefault => 0,
            PropertySource::ConfigFile => 1,
            PropertySource::Override => 2,
        }
    }
}

/// Flat key-value configuration with source tracking
///
/// Uses priority-based merging: higher priority sources override lower
/// priority sources.
#[derive(Debug, Clone, Default)]
pub struct FlatConfig {
    properties: HashMap<String, String>,
    sources: HashMap<String, PropertySource>,
}

impl FlatConfig {
    /// Create a new empty configuration
    #[inline]
    pub fn new() -> Self {
        Self {
            properties: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    /// Set a property with source tracking and priority-based override
    ///
    /// Only sets the value if the new source has equal or higher priority
    /// than the existing source.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, source: PropertySource) {
        let key = key.into();
        if let Some(existing) = self.sources.get(&key) {
            if existing.priority() > source.priority() {
                return;
            }
        }
        self.properties.insert(key.clone(), value.into());
        self.sources.insert(key, source);
    }

    /// Get a property value by key
    #[inline]
    pub fn get(&self, key: &str) -> Option<&String> {
        self.properties.get(key)
    }

    /// Check if a property exists
    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Merge another configuration into this one (respects priorities)
    pub fn merge(&mut self, other: &FlatConfig) {
        for (key, value) in &other.properties {
            if let Some(source) = other.sources.get(key) {
                self.set(key.clone(), value.clone(), *source);
            }
        }
    }
}

/// Typed engine configuration
///
/// Produced from a [`FlatConfig`] via [`EngineConfig::from_flat_config`],
/// or directly through [`EngineConfig::default`]. All values are
/// validated at construction; invalid values surface as
/// [`MarkovError::InvalidInput`] naming the offending key.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of tokens forming a chain prefix. Per tenant, immutable
    /// after the first snapshot is written.
    pub state_size: usize,

    /// Training batch granularity (records per pool submission)
    pub batch_size: usize,

    /// Number of workers in the task pool
    pub worker_pool_size: usize,

    /// Registry LRU ceiling in bytes
    pub chain_cache_memory_limit: u64,

    /// Quiet period after the last mutation before a snapshot is written
    pub save_debounce: Duration,

    /// Soft resident-memory ceiling applied while batches are built
    pub memory_ceiling_bytes: u64,

    /// How long pool shutdown waits for in-flight tasks
    pub graceful_shutdown: Duration,

    /// Sentinel token that ends a generation when sampled
    pub eol_token: String,

    /// Directory holding tenant snapshot files
    pub data_dir: PathBuf,

    /// Directory holding advisory training lock files
    pub config_dir: PathBuf,
}

impl EngineConfig {
    /// Parse engine configuration from a [`FlatConfig`]
    ///
    /// Missing keys fall back to the built-in defaults; present keys are
    /// parsed and validated. `markov.worker-pool-size` additionally
    /// accepts the literal `auto` to size the pool from the machine's
    /// logical CPU count.
    pub fn from_flat_config(config: &FlatConfig) -> MarkovResult<Self> {
        let defaults = Self::default();

        let state_size = parse_usize(config, "markov.state-size", defaults.state_size)?;
        if state_size < 1 {
            return Err(MarkovError::invalid_input_for(
                "markov.state-size must be >= 1",
                "markov.state-size",
            ));
        }

        let batch_size = parse_usize(config, "markov.batch-size", defaults.batch_size)?;
        if batch_size < 100 {
            return Err(MarkovError::invalid_input_for(
                "markov.batch-size must be >= 100",
                "markov.batch-size",
            ));
        }

        let worker_pool_size = match config.get("markov.worker-pool-size").map(String::as_str) {
            Some("auto") => num_cpus::get().max(1),
            _ => parse_usize(config, "markov.worker-pool-size", defaults.worker_pool_size)?,
        };
        if worker_pool_size < 1 {
            return Err(MarkovError::invalid_input_for(
                "markov.worker-pool-size must be >= 1",
                "markov.worker-pool-size",
            ));
        }

        let chain_cache_memory_limit = parse_u64(
            config,
            "markov.cache-memory-limit",
            defaults.chain_cache_memory_limit,
        )?;
        if chain_cache_memory_limit == 0 {
            return Err(MarkovError::invalid_input_for(
                "markov.cache-memory-limit must be > 0",
                "markov.cache-memory-limit",
            ));
        }

        let save_debounce_ms = parse_u64(
            config,
            "markov.save-debounce-ms",
            defaults.save_debounce.as_millis() as u64,
        )?;
        if save_debounce_ms < 1000 {
            return Err(MarkovError::invalid_input_for(
                "markov.save-debounce-ms must be >= 1000",
                "markov.save-debounce-ms",
            ));
        }

        let memory_ceiling_bytes = parse_u64(
            config,
            "markov.memory-ceiling-bytes",
            defaults.memory_ceiling_bytes,
        )?;
        if memory_ceiling_bytes == 0 {
            return Err(MarkovError::invalid_input_for(
                "markov.memory-ceiling-bytes must be > 0",
                "markov.memory-ceiling-bytes",
            ));
        }

        let graceful_shutdown_ms = parse_u64(
            config,
            "markov.shutdown-grace-ms",
            defaults.graceful_shutdown.as_millis() as u64,
        )?;

        let eol_token = config
            .get("markov.eol-token")
            .cloned()
            .unwrap_or(defaults.eol_token);
        if eol_token.is_empty() {
            return Err(MarkovError::invalid_input_for(
                "markov.eol-token must not be empty",
                "markov.eol-token",
            ));
        }

        let data_dir = config
            .get("markov.data-dir")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let config_dir = config
            .get("markov.config-dir")
            .map(PathBuf::from)
            .unwrap_or(defaults.config_dir);

        Ok(Self {
            state_size,
            batch_size,
            worker_pool_size,
            chain_cache_memory_limit,
            save_debounce: Duration::from_millis(save_debounce_ms),
            memory_ceiling_bytes,
            graceful_shutdown: Duration::from_millis(graceful_shutdown_ms),
            eol_token,
            data_dir,
            config_dir,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_size: 2,
            batch_size: 2000,
            worker_pool_size: 4,
            chain_cache_memory_limit: 128 * 1024 * 1024,
            save_debounce: Duration::from_millis(5000),
            memory_ceiling_bytes: 1024 * 1024 * 1024,
            graceful_shutdown: Duration::from_millis(5000),
            eol_token: "\n".to_string(),
            data_dir: PathBuf::from("./data"),
            config_dir: PathBuf::from("./config"),
        }
    }
}

fn parse_usize(config: &FlatConfig, key: &str, default: usize) -> MarkovResult<usize> {
    match config.get(key) {
        Some(raw) => raw.parse::<usize>().map_err(|_| {
            MarkovError::invalid_input_for(format!("{key} must be a non-negative integer"), key)
        }),
        None => Ok(default),
    }
}

fn parse_u64(config: &FlatConfig, key: &str, default: u64) -> MarkovResult<u64> {
    match config.get(key) {
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            MarkovError::invalid_input_for(format!("{key} must be a non-negative integer"), key)
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.state_size, 2);
        assert_eq!(config.batch_size, 2000);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.save_debounce, Duration::from_millis(5000));
    }

    #[test]
    fn test_priority_override() {
        let mut flat = FlatConfig::new();
        flat.set("markov.state-size", "3", PropertySource::Override);
        flat.set("markov.state-size", "5", PropertySource::ConfigFile);
        assert_eq!(flat.get("markov.state-size").unwrap(), "3");

        let config = EngineConfig::from_flat_config(&flat).unwrap();
        assert_eq!(config.state_size, 3);
    }

    #[test]
    fn test_equal_priority_last_wins() {
        let mut flat = FlatConfig::new();
        flat.set("markov.batch-size", "500", PropertySource::ConfigFile);
        flat.set("markov.batch-size", "800", PropertySource::ConfigFile);
        assert_eq!(flat.get("markov.batch-size").unwrap(), "800");
    }

    #[test]
    fn test_merge_respects_priorities() {
        let mut base = FlatConfig::new();
        base.set("markov.eol-token", "<end>", PropertySource::Override);
        let mut other = FlatConfig::new();
        other.set("markov.eol-token", "#", PropertySource::ConfigFile);
        other.set("markov.batch-size", "300", PropertySource::ConfigFile);

        base.merge(&other);
        assert_eq!(base.get("markov.eol-token").unwrap(), "<end>");
        assert_eq!(base.get("markov.batch-size").unwrap(), "300");
    }

    #[test]
    fn test_state_size_lower_bound() {
        let mut flat = FlatConfig::new();
        flat.set("markov.state-size", "0", PropertySource::ConfigFile);
        let err = EngineConfig::from_flat_config(&flat).unwrap_err();
        assert!(matches!(err, MarkovError::InvalidInput { .. }));
    }

    #[test]
    fn test_batch_size_lower_bound() {
        let mut flat = FlatConfig::new();
        flat.set("markov.batch-size", "99", PropertySource::ConfigFile);
        assert!(EngineConfig::from_flat_config(&flat).is_err());
    }

    #[test]
    fn test_debounce_lower_bound() {
        let mut flat = FlatConfig::new();
        flat.set("markov.save-debounce-ms", "500", PropertySource::ConfigFile);
        assert!(EngineConfig::from_flat_config(&flat).is_err());
    }

    #[test]
    fn test_auto_worker_pool_size() {
        let mut flat = FlatConfig::new();
        flat.set("markov.worker-pool-size", "auto", PropertySource::ConfigFile);
        let config = EngineConfig::from_flat_config(&flat).unwrap();
        assert!(config.worker_pool_size >= 1);
    }

    #[test]
    fn test_malformed_integer_rejected() {
        let mut flat = FlatConfig::new();
        flat.set("markov.cache-memory-limit", "lots", PropertySource::ConfigFile);
        let err = EngineConfig::from_flat_config(&flat).unwrap_err();
        match err {
            MarkovError::InvalidInput { field, .. } => {
                assert_eq!(field.as_deref(), Some("markov.cache-memory-limit"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
