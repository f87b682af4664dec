use crate::error::{ParseError, PipelineError};
use crate::models::{FieldValue, NormalizedRecord};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

pub mod extract;

use extract::{extract_number, parse_number, NUMBER_IN_TEXT};

/// Pull a number out of a free-text field into `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractRule {
    pub field: String,
    /// Regex with a `value` group (or group 1). Defaults to the first number in the text.
    #[serde(default)]
    pub pattern: Option<String>,
    pub target: String,
}

/// How the timestamp field is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// Full calendar dates and date-times (`2024-01-03`, `20240103`, RFC 3339),
    /// plus epoch values with 10 (seconds) or 13 (milliseconds) digits.
    #[default]
    Auto,
    EpochSeconds,
    EpochMillis,
    /// Year-only values (`2023`), placed on January 1st.
    Year,
}

/// Shape of the upstream payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserSpec {
    /// Dot path to the record array, e.g. `observations` or `response.data`.
    /// Numeric segments index into arrays. `None` means the payload itself is the array.
    pub records_path: Option<String>,
    pub timestamp_field: String,
    pub timestamp_format: TimestampFormat,
    pub value_fields: Vec<String>,
    /// Fields besides the timestamp that must be present for a record to count.
    pub required_fields: Vec<String>,
    pub extract_rules: Vec<ExtractRule>,
    /// String values treated as "no data", e.g. FRED's `"."`.
    pub missing_markers: Vec<String>,
}

impl Default for ParserSpec {
    fn default() -> Self {
        Self {
            records_path: None,
            timestamp_field: "date".to_string(),
            timestamp_format: TimestampFormat::Auto,
            value_fields: vec!["value".to_string()],
            required_fields: Vec::new(),
            extract_rules: Vec::new(),
            missing_markers: vec![".".to_string(), String::new()],
        }
    }
}

/// Records decoded from one payload plus everything that was dropped on the way.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub records: Vec<NormalizedRecord>,
    pub skipped: Vec<ParseError>,
    /// Extraction rules whose pattern did not match. Not errors.
    pub soft_misses: usize,
}

struct CompiledRule {
    field: String,
    pattern: Option<Regex>,
    target: String,
}

pub struct ResponseParser {
    spec: ParserSpec,
    rules: Vec<CompiledRule>,
}

impl ResponseParser {
    pub fn new(spec: ParserSpec) -> Result<Self, PipelineError> {
        if spec.timestamp_field.trim().is_empty() {
            return Err(PipelineError::Config("parser.timestamp_field is empty".into()));
        }

        let rules = spec
            .extract_rules
            .iter()
            .map(|rule| {
                let pattern = match &rule.pattern {
                    Some(p) => Some(Regex::new(p).map_err(|e| {
                        PipelineError::Config(format!("bad extract pattern for '{}': {}", rule.field, e))
                    })?),
                    None => None,
                };
                Ok(CompiledRule { field: rule.field.clone(), pattern, target: rule.target.clone() })
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;

        Ok(Self { spec, rules })
    }

    pub fn spec(&self) -> &ParserSpec {
        &self.spec
    }

    /// Decode `payload` for `key`. `Err` means the payload as a whole is
    /// unusable; individual bad records end up in `ParseOutcome::skipped`.
    pub fn parse(&self, key: &str, payload: &[u8]) -> Result<ParseOutcome, ParseError> {
        let json: Value = serde_json::from_slice(payload).map_err(|e| ParseError::InvalidPayload(e.to_string()))?;

        let path = self.spec.records_path.as_deref().unwrap_or("");
        let records = select_path(&json, path)
            .and_then(Value::as_array)
            .ok_or_else(|| ParseError::MissingRecords(path.to_string()))?;

        let mut outcome = ParseOutcome::default();
        for (index, raw) in records.iter().enumerate() {
            match self.parse_record(key, index, raw, &mut outcome.soft_misses) {
                Ok(record) => outcome.records.push(record),
                Err(e) => {
                    debug!(key, "skipping record: {}", e);
                    outcome.skipped.push(e);
                }
            }
        }

        Ok(outcome)
    }

    fn parse_record(
        &self,
        key: &str,
        index: usize,
        raw: &Value,
        soft_misses: &mut usize,
    ) -> Result<NormalizedRecord, ParseError> {
        let ts_field = &self.spec.timestamp_field;
        let ts_value = raw
            .get(ts_field)
            .filter(|v| !self.is_missing(v))
            .ok_or_else(|| ParseError::MissingField { index, field: ts_field.clone() })?;

        let timestamp = resolve_timestamp(ts_value, self.spec.timestamp_format).ok_or_else(|| ParseError::BadTimestamp {
            index,
            raw: value_to_text(ts_value),
        })?;

        for field in &self.spec.required_fields {
            if raw.get(field).map_or(true, |v| self.is_missing(v)) {
                return Err(ParseError::MissingField { index, field: field.clone() });
            }
        }

        let mut fields = BTreeMap::new();
        for field in &self.spec.value_fields {
            if let Some(value) = raw.get(field).and_then(|v| self.to_field_value(v)) {
                fields.insert(field.clone(), value);
            }
        }

        for rule in &self.rules {
            let Some(text) = raw.get(&rule.field).and_then(Value::as_str) else {
                continue;
            };
            let pattern = rule.pattern.as_ref().unwrap_or(&NUMBER_IN_TEXT);
            match extract_number(text, pattern) {
                Some(number) => {
                    fields.insert(rule.target.clone(), FieldValue::Number(number));
                }
                None => {
                    *soft_misses += 1;
                    debug!(key, index, field = %rule.field, "pattern did not match '{}'", text);
                }
            }
        }

        Ok(NormalizedRecord { key: key.to_string(), timestamp, fields })
    }

    fn is_missing(&self, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::String(s) => self.spec.missing_markers.iter().any(|m| m == s.trim()),
            _ => false,
        }
    }

    fn to_field_value(&self, value: &Value) -> Option<FieldValue> {
        if self.is_missing(value) {
            return None;
        }
        match value {
            Value::Number(n) => n.as_f64().map(FieldValue::Number),
            Value::String(s) => Some(match parse_number(s) {
                Some(n) => FieldValue::Number(n),
                None => FieldValue::Text(s.clone()),
            }),
            Value::Bool(b) => Some(FieldValue::Number(if *b { 1.0 } else { 0.0 })),
            _ => None,
        }
    }
}

fn select_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            Value::Object(map) => map.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn from_epoch_seconds(value: i64) -> Option<NaiveDateTime> {
    Some(DateTime::from_timestamp(value, 0)?.naive_utc())
}

fn from_epoch_millis(value: i64) -> Option<NaiveDateTime> {
    Some(DateTime::from_timestamp_millis(value)?.naive_utc())
}

/// Integer from a JSON number or an all-digit string, with its digit count.
fn integer_of(value: &Value) -> Option<(i64, usize)> {
    let text = match value {
        Value::Number(n) => n.as_i64()?.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    let digits = text.strip_prefix('-').unwrap_or(&text);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((text.parse().ok()?, digits.len()))
}

fn parse_calendar(s: &str) -> Option<NaiveDateTime> {
    for format in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    // keep the wall-clock date the upstream published, offsets are not applied
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    None
}

/// Resolve a timestamp field to a naive date-time. Partial or ambiguous
/// values (a bare year, a short integer) yield `None` unless `format` asks
/// for them explicitly.
pub fn resolve_timestamp(value: &Value, format: TimestampFormat) -> Option<NaiveDateTime> {
    match format {
        TimestampFormat::EpochSeconds => from_epoch_seconds(integer_of(value)?.0),
        TimestampFormat::EpochMillis => from_epoch_millis(integer_of(value)?.0),
        TimestampFormat::Year => {
            let (year, digits) = integer_of(value)?;
            if digits != 4 {
                return None;
            }
            NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, 1, 1)?.and_hms_opt(0, 0, 0)
        }
        TimestampFormat::Auto => {
            if let Value::String(s) = value {
                if let Some(dt) = parse_calendar(s.trim()) {
                    return Some(dt);
                }
            }
            match integer_of(value)? {
                (secs, 10) => from_epoch_seconds(secs),
                (millis, 13) => from_epoch_millis(millis),
                _ => None,
            }
        }
    }
}
