use crate::error::{ErrorKind, FetchError};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Half-open calendar range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// One HTTP request for one key over one sub-range.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTask {
    pub key: String,
    pub url: String,
    pub params: BTreeMap<String, String>,
    pub attempt: u32,
    pub method: HttpMethod,
    pub range: DateRange,
    /// Index of the sub-range within the key's full range.
    pub chunk: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub key: String,
    pub chunk: usize,
    pub range: DateRange,
    pub status: FetchStatus,
    pub payload: Option<Vec<u8>>,
    pub error: Option<FetchError>,
    pub attempts: u32,
    pub latency: Duration,
}

impl FetchResult {
    pub fn success(task: &FetchTask, payload: Vec<u8>, attempts: u32, latency: Duration) -> Self {
        Self {
            key: task.key.clone(),
            chunk: task.chunk,
            range: task.range,
            status: FetchStatus::Success,
            payload: Some(payload),
            error: None,
            attempts,
            latency,
        }
    }

    pub fn failure(task: &FetchTask, error: FetchError, attempts: u32, latency: Duration) -> Self {
        Self {
            key: task.key.clone(),
            chunk: task.chunk,
            range: task.range,
            status: FetchStatus::Failure,
            payload: None,
            error: Some(error),
            attempts,
            latency,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == FetchStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub key: String,
    pub timestamp: NaiveDateTime,
    pub fields: BTreeMap<String, FieldValue>,
}

impl NormalizedRecord {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// Finalized statistics for one numeric field in one window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldStats {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl FieldStats {
    /// Derived from sum and count at read time, `None` for an empty window.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowBucket {
    pub key: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub aggregates: BTreeMap<String, FieldStats>,
}

impl WindowBucket {
    pub fn stats(&self, field: &str) -> FieldStats {
        self.aggregates.get(field).copied().unwrap_or_default()
    }

    pub fn is_gap(&self) -> bool {
        self.aggregates.values().all(FieldStats::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub key: String,
    pub error_kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
    /// True when the key also produced data for some of its sub-ranges.
    pub partial: bool,
    pub failed_ranges: Vec<DateRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub key: String,
    pub chunk: usize,
    pub reason: String,
}

/// Flat row handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub key: String,
    pub field: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub count: u64,
    pub sum: f64,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub buckets: Vec<WindowBucket>,
    pub failures: Vec<FailureReport>,
    pub skipped: Vec<SkippedRecord>,
    pub cancelled: bool,
}

impl ResultTable {
    pub fn buckets_for<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a WindowBucket> + 'a {
        self.buckets.iter().filter(move |b| b.key == key)
    }

    pub fn failure_for(&self, key: &str) -> Option<&FailureReport> {
        self.failures.iter().find(|f| f.key == key)
    }

    /// One row per (bucket, field), in bucket order then field name order.
    pub fn rows(&self, fields: &[String]) -> Vec<TableRow> {
        let mut rows = Vec::new();
        for bucket in &self.buckets {
            let mut names: Vec<&String> = fields.iter().collect();
            for name in bucket.aggregates.keys() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            names.sort();

            for name in names {
                let stats = bucket.stats(name);
                rows.push(TableRow {
                    key: bucket.key.clone(),
                    field: name.clone(),
                    window_start: bucket.window_start,
                    window_end: bucket.window_end,
                    count: stats.count,
                    sum: stats.sum,
                    mean: stats.mean(),
                    min: stats.min,
                    max: stats.max,
                });
            }
        }
        rows
    }
}
