use crate::core::calendar::Granularity;
use crate::core::rate_limiter::{BackoffConfig, RetryPolicy};
use crate::error::{PipelineError, Result};
use crate::fetcher::request::RequestTemplate;
use crate::models::DateRange;
use crate::parser::ParserSpec;
use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MAX_CONCURRENCY_CEILING: usize = 256;

fn default_granularity() -> Granularity {
    Granularity::Week
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Everything one pipeline run needs. Passed explicitly to every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub keys: Vec<String>,
    pub start: NaiveDate,
    /// Exclusive.
    pub end: NaiveDate,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Total attempts per request, the first one included.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional wall-clock budget for the whole run.
    #[serde(default)]
    pub run_deadline_ms: Option<u64>,
    /// Sent as an `Authorization` header, never logged.
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,
    pub request: RequestTemplate,
    #[serde(default)]
    pub parser: ParserSpec,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl PipelineConfig {
    pub fn new(keys: Vec<String>, start: NaiveDate, end: NaiveDate, request: RequestTemplate) -> Self {
        Self {
            keys,
            start,
            end,
            granularity: default_granularity(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            run_deadline_ms: None,
            api_token: None,
            request,
            parser: ParserSpec::default(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Configuration-level checks. Failing here aborts the run before any
    /// request is issued. A bad date range is not checked here: it is reported
    /// per key.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY_CEILING {
            return Err(PipelineError::Config(format!(
                "max_concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY_CEILING, self.max_concurrency
            )));
        }
        if self.max_retries == 0 {
            return Err(PipelineError::Config("max_retries must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(PipelineError::Config("request_timeout_ms must be positive".into()));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(PipelineError::Config("backoff.base_delay_ms exceeds backoff.max_delay_ms".into()));
        }
        if self.keys.iter().any(|k| k.trim().is_empty()) {
            return Err(PipelineError::Config("keys must not contain empty strings".into()));
        }
        self.request.validate()
    }

    pub fn range(&self) -> DateRange {
        DateRange::new(self.start, self.end)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff.clone())
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Build from `ROLLUP_*` environment variables (a `.env` file is honoured).
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| lookup(name).filter(|v| !v.trim().is_empty()).ok_or_else(|| anyhow!("{} is not set", name));
        let date = |name: &str| -> anyhow::Result<NaiveDate> {
            let raw = required(name)?;
            NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").with_context(|| format!("{} '{}' is not YYYY-MM-DD", name, raw))
        };
        let number = |name: &str| -> anyhow::Result<Option<u64>> {
            match lookup(name) {
                Some(raw) => Ok(Some(raw.trim().parse::<u64>().with_context(|| format!("{} '{}' is not a number", name, raw))?)),
                None => Ok(None),
            }
        };
        let narrow = |name: &str, n: u64| -> anyhow::Result<u32> {
            u32::try_from(n).with_context(|| format!("{} '{}' is out of range", name, n))
        };
        let list = |raw: String| -> Vec<String> {
            raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
        };

        let mut request = RequestTemplate { base_url: required("ROLLUP_BASE_URL")?, ..Default::default() };
        if let Some(template) = lookup("ROLLUP_QUERY_TEMPLATE") {
            request.query_template = template;
        }
        if let Some(span) = number("ROLLUP_MAX_SPAN_DAYS")? {
            request.max_span_days = narrow("ROLLUP_MAX_SPAN_DAYS", span)?;
        }
        if let (Some(param), Some(key)) = (lookup("ROLLUP_API_KEY_PARAM"), lookup("ROLLUP_API_KEY")) {
            request.extra_params.insert(param, key.trim().to_string());
        }

        let mut config = Self::new(list(required("ROLLUP_KEYS")?), date("ROLLUP_START")?, date("ROLLUP_END")?, request);

        if let Some(raw) = lookup("ROLLUP_GRANULARITY") {
            config.granularity = raw.parse::<Granularity>().map_err(|e| anyhow!(e))?;
        }
        if let Some(n) = number("ROLLUP_MAX_CONCURRENCY")? {
            config.max_concurrency = usize::try_from(n).with_context(|| format!("ROLLUP_MAX_CONCURRENCY '{}' is out of range", n))?;
        }
        if let Some(n) = number("ROLLUP_MAX_RETRIES")? {
            config.max_retries = narrow("ROLLUP_MAX_RETRIES", n)?;
        }
        if let Some(n) = number("ROLLUP_TIMEOUT_MS")? {
            config.request_timeout_ms = n;
        }
        config.run_deadline_ms = number("ROLLUP_DEADLINE_MS")?;
        config.api_token = lookup("ROLLUP_API_TOKEN");

        if let Some(path) = lookup("ROLLUP_RECORDS_PATH") {
            config.parser.records_path = Some(path);
        }
        if let Some(field) = lookup("ROLLUP_TIMESTAMP_FIELD") {
            config.parser.timestamp_field = field;
        }
        if let Some(raw) = lookup("ROLLUP_TIMESTAMP_FORMAT") {
            config.parser.timestamp_format = serde_json::from_value(serde_json::Value::String(raw.trim().to_string()))
                .with_context(|| format!("ROLLUP_TIMESTAMP_FORMAT '{}' is not one of auto, epoch_seconds, epoch_millis, year", raw))?;
        }
        if let Some(fields) = lookup("ROLLUP_VALUE_FIELDS") {
            config.parser.value_fields = list(fields);
        }

        Ok(config)
    }
}
