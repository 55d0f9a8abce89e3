// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming training batcher.
//!
//! Consumes a source of messages, tokenizes each one, slides a window
//! of `state_size + 1` tokens to produce training records, and submits
//! them to the worker pool in batches. The source is pulled lazily so
//! arbitrarily large imports never have to fit in memory; between
//! batches the resident set is sampled and the batcher backs off while
//! it exceeds the configured soft ceiling.
//!
//! Tenant-level exclusion is provided by the advisory
//! [`TrainingLock`]: a concurrent bulk train of the same tenant fails
//! fast with a contention error instead of interleaving.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::chain::TrainingRecord;
use crate::core::config::EngineConfig;
use crate::core::error::{MarkovError, MarkovResult};
use crate::core::pool::{TaskOutput, TaskPayload, TaskPriority, WorkerPool};
use crate::core::train::record_source::TrainingMessage;
use crate::core::train::training_lock::TrainingLock;

/// Pause applied when the resident set exceeds the soft ceiling
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Progress is logged every this many submitted batches
const PROGRESS_EVERY: usize = 10;

/// Summary of one bulk training run
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainReport {
    pub messages: usize,
    pub records: usize,
    pub batches: usize,
}

/// Splits message streams into batched training records and feeds the
/// worker pool.
pub struct TrainBatcher {
    pool: Arc<WorkerPool>,
    config: Arc<EngineConfig>,
}

impl TrainBatcher {
    pub fn new(pool: Arc<WorkerPool>, config: Arc<EngineConfig>) -> Self {
        Self { pool, config }
    }

    /// Train `tenant_id` from a message source.
    ///
    /// Takes the tenant's advisory lock for the duration of the run.
    /// Each full batch is submitted as a `build-chains` task at normal
    /// priority and awaited before the next one is built, so batches
    /// apply in order and at most one batch is resident at a time.
    ///
    /// # Errors
    /// - [`MarkovError::Contention`] when the tenant is already training
    /// - any error the source yields, or a failed batch task
    pub fn train<I>(
        &self,
        tenant_id: &str,
        source: I,
        clear_existing: bool,
    ) -> MarkovResult<TrainReport>
    where
        I: IntoIterator<Item = MarkovResult<TrainingMessage>>,
    {
        let _lock = TrainingLock::acquire(&self.config.config_dir, tenant_id)?;

        let batch_size = self.config.batch_size;
        let state_size = self.config.state_size;
        let eol = self.config.eol_token.as_str();

        let mut report = TrainReport::default();
        let mut batch: Vec<TrainingRecord> = Vec::with_capacity(batch_size);
        let mut first_batch = clear_existing;

        for message in source {
            let message = message?;
            let tokens = tokenize_message(&message.message);
            if tokens.is_empty() {
                continue;
            }
            report.messages += 1;
            batch.extend(sliding_records(&tokens, state_size, eol));

            while batch.len() >= batch_size {
                let rest = batch.split_off(batch_size);
                let full = std::mem::replace(&mut batch, rest);
                report.records += self.submit_batch(tenant_id, full, first_batch)?;
                first_batch = false;
                report.batches += 1;
                self.log_progress(tenant_id, &report);
                self.throttle_on_memory();
            }
        }

        if !batch.is_empty() || first_batch {
            report.records += self.submit_batch(tenant_id, batch, first_batch)?;
            report.batches += 1;
        }

        log::info!(
            "tenant '{tenant_id}': training finished ({} messages, {} records, {} batches)",
            report.messages,
            report.records,
            report.batches
        );
        Ok(report)
    }

    fn submit_batch(
        &self,
        tenant_id: &str,
        records: Vec<TrainingRecord>,
        clear_existing: bool,
    ) -> MarkovResult<usize> {
        let handle = self.pool.submit(
            TaskPayload::BuildChains {
                tenant_id: tenant_id.to_string(),
                records,
                clear_existing,
            },
            TaskPriority::Normal,
        )?;
        match handle.wait()? {
            TaskOutput::ChainsBuilt { processed_count } => Ok(processed_count),
            other => Err(MarkovError::worker(format!(
                "build-chains task returned unexpected output: {other:?}"
            ))),
        }
    }

    fn log_progress(&self, tenant_id: &str, report: &TrainReport) {
        if report.batches % PROGRESS_EVERY == 0 {
            log::info!(
                "tenant '{tenant_id}': {} batches submitted ({} records from {} messages)",
                report.batches,
                report.records,
                report.messages
            );
        }
    }

    fn throttle_on_memory(&self) {
        if let Some(resident) = resident_memory_bytes() {
            if resident > self.config.memory_ceiling_bytes {
                log::warn!(
                    "resident set {resident} bytes exceeds ceiling {}; pausing",
                    self.config.memory_ceiling_bytes
                );
                thread::sleep(MEMORY_POLL_INTERVAL);
            }
        }
    }
}

/// Scrub chat-platform mention markup and split on whitespace.
///
/// Removes `<@123>`, `<@!123>`, `<@&123>` and `<#123>` spans; whatever
/// remains is whitespace-split into tokens.
pub fn tokenize_message(content: &str) -> Vec<String> {
    scrub_mentions(content)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Produce one record per sliding window of `state_size + 1` tokens.
///
/// The end-of-line sentinel is appended first, so every message that
/// reaches the window size contributes a terminating record and
/// generations learn where messages stop. Messages shorter than the
/// window contribute nothing.
pub fn sliding_records(tokens: &[String], state_size: usize, eol: &str) -> Vec<TrainingRecord> {
    let window = state_size + 1;
    let mut padded: Vec<&str> = tokens.iter().map(String::as_str).collect();
    padded.push(eol);
    if padded.len() < window {
        return Vec::new();
    }

    let mut records = Vec::with_capacity(padded.len() - window + 1);
    for chunk in padded.windows(window) {
        records.push(TrainingRecord::new(
            chunk[..state_size].join(" "),
            chunk[state_size],
            1,
        ));
    }
    records
}

fn scrub_mentions(content: &str) -> String {
    let bytes = content.as_bytes();
    let mut out = String::with_capacity(content.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'<' {
            if let Some(end) = mention_end(&bytes[i..]) {
                i += end;
                continue;
            }
        }
        // advance one UTF-8 scalar
        let ch_len = content[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&content[i..i + ch_len]);
        i += ch_len;
    }
    out
}

/// Length of a mention span starting at `bytes[0] == b'<'`, if any.
/// Accepted shapes: `<@id>`, `<@!id>`, `<@&id>`, `<#id>`.
fn mention_end(bytes: &[u8]) -> Option<usize> {
    let mut i = 1;
    match bytes.get(i)? {
        b'@' => {
            i += 1;
            if matches!(bytes.get(i), Some(b'!') | Some(b'&')) {
                i += 1;
            }
        }
        b'#' => i += 1,
        _ => return None,
    }
    let digits_start = i;
    while bytes.get(i).is_some_and(u8::is_ascii_digit) {
        i += 1;
    }
    if i == digits_start || bytes.get(i) != Some(&b'>') {
        return None;
    }
    Some(i + 1)
}

/// Resident set size of this process in bytes, where the platform
/// exposes it cheaply.
#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}
