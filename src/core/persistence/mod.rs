// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod debounce;
pub mod snapshot;

pub use self::debounce::Debouncer;
pub use self::snapshot::{
    load_snapshot, snapshot_path, write_snapshot, ChainRecord, SnapshotFile, SCHEMA_VERSION,
    SNAPSHOT_MAGIC,
};
