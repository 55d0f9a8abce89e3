// SPDX-License-Identifier: MIT OR Apache-2.0

//! Snapshot file format and atomic on-disk persistence.
//!
//! One file per tenant under the configured data directory, named
//! `markov_<tenantId>.json`. The file is a single UTF-8 JSON object: a
//! small header (magic, schema version, state size, tenant id, save
//! timestamp) followed by the chain mapping. Alias tables are never
//! persisted; they are rebuilt on demand after load.
//!
//! Writes go to a `.tmp` sibling, fsync, then rename over the target,
//! so a partial write can never replace a good snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::chain::prefix_entry::SuffixEntry;
use crate::core::error::{MarkovError, MarkovResult};

/// Magic tag carried by every snapshot file
pub const SNAPSHOT_MAGIC: &str = "MKOV";

/// Schema version this build reads and writes
pub const SCHEMA_VERSION: u32 = 1;

/// Persisted form of one prefix and its observed suffixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRecord {
    pub prefix: String,
    pub suffixes: Vec<SuffixEntry>,
    pub total_weight: u64,
}

/// Full snapshot of one tenant's chain store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile {
    pub magic: String,
    pub schema_version: u32,
    pub state_size: usize,
    pub tenant_id: String,
    pub saved_at: String,
    /// Prefix string -> chain record. A BTreeMap keeps the on-disk key
    /// order stable across rewrites, which keeps snapshots diffable.
    pub chains: BTreeMap<String, ChainRecord>,
}

impl SnapshotFile {
    pub fn new(tenant_id: impl Into<String>, state_size: usize) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC.to_string(),
            schema_version: SCHEMA_VERSION,
            state_size,
            tenant_id: tenant_id.into(),
            saved_at: Utc::now().to_rfc3339(),
            chains: BTreeMap::new(),
        }
    }
}

/// Path of the snapshot file for one tenant
pub fn snapshot_path(data_dir: &Path, tenant_id: &str) -> PathBuf {
    data_dir.join(format!("markov_{tenant_id}.json"))
}

/// Write a snapshot atomically: temp sibling, fsync, rename.
pub fn write_snapshot(path: &Path, snapshot: &SnapshotFile) -> MarkovResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let body = serde_json::to_vec(snapshot)
        .map_err(|e| MarkovError::worker_with_source("snapshot serialization failed", e.into()))?;

    let mut file = fs::File::create(&tmp)?;
    file.write_all(&body)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    log::debug!(
        "wrote snapshot for tenant '{}' ({} prefixes, {} bytes)",
        snapshot.tenant_id,
        snapshot.chains.len(),
        body.len()
    );
    Ok(())
}

/// Load a snapshot from disk.
///
/// Returns `Ok(None)` when no file exists (a tenant that has never been
/// saved). An unreadable, truncated or wrong-schema file returns
/// [`MarkovError::Corrupt`]; callers start empty and must leave the bad
/// file on disk for operator inspection.
pub fn load_snapshot(path: &Path) -> MarkovResult<Option<SnapshotFile>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MarkovError::Io(e)),
    };

    let snapshot: SnapshotFile = serde_json::from_slice(&bytes).map_err(|e| {
        MarkovError::corrupt_at(
            format!("malformed snapshot body: {e}"),
            path.display().to_string(),
        )
    })?;

    if snapshot.magic != SNAPSHOT_MAGIC {
        return Err(MarkovError::corrupt_at(
            format!("bad magic '{}'", snapshot.magic),
            path.display().to_string(),
        ));
    }
    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(MarkovError::corrupt_at(
            format!(
                "unsupported schema version {} (expected {})",
                snapshot.schema_version, SCHEMA_VERSION
            ),
            path.display().to_string(),
        ));
    }

    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> SnapshotFile {
        let mut snapshot = SnapshotFile::new("guild-1", 2);
        snapshot.chains.insert(
            "a b".to_string(),
            ChainRecord {
                prefix: "a b".to_string(),
                suffixes: vec![
                    SuffixEntry {
                        word: "c".to_string(),
                        weight: 1,
                    },
                    SuffixEntry {
                        word: "d".to_string(),
                        weight: 3,
                    },
                ],
                total_weight: 4,
            },
        );
        snapshot
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), "guild-1");

        write_snapshot(&path, &sample_snapshot()).unwrap();
        let loaded = load_snapshot(&path).unwrap().unwrap();

        assert_eq!(loaded.tenant_id, "guild-1");
        assert_eq!(loaded.state_size, 2);
        let record = &loaded.chains["a b"];
        assert_eq!(record.total_weight, 4);
        assert_eq!(record.suffixes.len(), 2);
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), "nobody");
        assert!(load_snapshot(&path).unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_corrupt_and_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), "guild-2");
        fs::write(&path, b"\"garbage\"").unwrap();

        let err = load_snapshot(&path).unwrap_err();
        assert!(matches!(err, MarkovError::Corrupt { .. }));
        assert!(path.exists());
    }

    #[test]
    fn test_wrong_magic_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), "guild-3");
        let mut snapshot = sample_snapshot();
        snapshot.magic = "NOPE".to_string();
        write_snapshot(&path, &snapshot).unwrap();

        assert!(matches!(
            load_snapshot(&path),
            Err(MarkovError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_future_schema_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), "guild-4");
        let mut snapshot = sample_snapshot();
        snapshot.schema_version = SCHEMA_VERSION + 1;
        write_snapshot(&path, &snapshot).unwrap();

        assert!(matches!(
            load_snapshot(&path),
            Err(MarkovError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_no_tmp_file_survives_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), "guild-5");
        write_snapshot(&path, &sample_snapshot()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
