// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod alias_table;
pub mod chain_store;
pub mod prefix_entry;
pub mod registry;

pub use self::alias_table::AliasTable;
pub use self::chain_store::{
    BatchReport, ChainStore, LoadOutcome, StoreStats, TrainingRecord,
};
pub use self::prefix_entry::{PrefixEntry, SuffixEntry};
pub use self::registry::StoreRegistry;
