// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod batcher;
pub mod record_source;
pub mod training_lock;

pub use self::batcher::{sliding_records, tokenize_message, TrainBatcher, TrainReport};
pub use self::record_source::{JsonImportSource, TrainingMessage};
pub use self::training_lock::TrainingLock;
