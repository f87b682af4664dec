use crate::error::ErrorKind;
use crate::models::{DateRange, FailureReport, ResultTable, SkippedRecord, WindowBucket};
use std::collections::BTreeMap;

#[derive(Debug)]
struct FailedChunk {
    range: DateRange,
    kind: ErrorKind,
    message: String,
    attempts: u32,
}

#[derive(Debug, Default)]
struct KeyOutcome {
    succeeded: usize,
    failed: Vec<FailedChunk>,
}

/// Collects per-key fetch outcomes during a run and builds the final table.
#[derive(Debug, Default)]
pub struct ResultAssembler {
    keys: BTreeMap<String, KeyOutcome>,
    skipped: Vec<SkippedRecord>,
    cancelled: bool,
}

impl ResultAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, key: &str) {
        self.keys.entry(key.to_string()).or_default().succeeded += 1;
    }

    pub fn record_failure(&mut self, key: &str, range: DateRange, kind: ErrorKind, message: String, attempts: u32) {
        if kind == ErrorKind::Cancelled {
            self.cancelled = true;
        }
        self.keys.entry(key.to_string()).or_default().failed.push(FailedChunk {
            range,
            kind,
            message,
            attempts,
        });
    }

    pub fn record_skip(&mut self, key: &str, chunk: usize, reason: String) {
        self.skipped.push(SkippedRecord { key: key.to_string(), chunk, reason });
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn has_success(&self, key: &str) -> bool {
        self.keys.get(key).is_some_and(|o| o.succeeded > 0)
    }

    /// Build the table. Buckets are kept only for keys with at least one
    /// successful sub-range and are ordered by (key, window_start).
    pub fn assemble(self, buckets: BTreeMap<String, Vec<WindowBucket>>) -> ResultTable {
        let mut rows: Vec<WindowBucket> = buckets
            .into_iter()
            .filter(|(key, _)| self.has_success(key))
            .flat_map(|(_, b)| b)
            .collect();
        rows.sort_by(|a, b| (&a.key, a.window_start).cmp(&(&b.key, b.window_start)));

        let mut failures = Vec::new();
        for (key, outcome) in self.keys {
            if outcome.failed.is_empty() {
                continue;
            }

            let mut failed = outcome.failed;
            failed.sort_by_key(|f| f.range);
            // the earliest failed sub-range speaks for the key
            let first = &failed[0];
            failures.push(FailureReport {
                key,
                error_kind: first.kind,
                message: first.message.clone(),
                attempts: failed.iter().map(|f| f.attempts).sum(),
                partial: outcome.succeeded > 0,
                failed_ranges: failed.iter().map(|f| f.range).collect(),
            });
        }

        let mut skipped = self.skipped;
        skipped.sort_by(|a, b| (&a.key, a.chunk).cmp(&(&b.key, b.chunk)));

        ResultTable { buckets: rows, failures, skipped, cancelled: self.cancelled }
    }
}
