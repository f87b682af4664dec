use crate::core::calendar::split_range;
use crate::error::{PipelineError, Result};
use crate::models::{DateRange, FetchTask, HttpMethod};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// How requests for a key are laid out against the upstream API.
///
/// `query_template` is appended to `base_url` and may contain the
/// placeholders `{key}`, `{start}`, `{end}` (exclusive) and `{end_inclusive}`.
/// Every substituted value is percent-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestTemplate {
    pub base_url: String,
    pub query_template: String,
    pub extra_params: BTreeMap<String, String>,
    pub method: HttpMethod,
    /// Longest span the API accepts in one request.
    pub max_span_days: u32,
}

impl Default for RequestTemplate {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            query_template: "?key={key}&start={start}&end={end}".to_string(),
            extra_params: BTreeMap::new(),
            method: HttpMethod::Get,
            max_span_days: 30,
        }
    }
}

impl RequestTemplate {
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(PipelineError::Config("request.base_url is empty".into()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(PipelineError::Config(format!(
                "request.base_url '{}' is not an http(s) URL",
                self.base_url
            )));
        }
        if !self.query_template.contains("{key}") {
            return Err(PipelineError::Config("request.query_template has no {key} placeholder".into()));
        }
        if self.max_span_days == 0 {
            return Err(PipelineError::Config("request.max_span_days must be positive".into()));
        }
        Ok(())
    }

    /// One task per sub-range of `[start, end)` for `key`.
    pub fn build_tasks(&self, key: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<FetchTask>> {
        if start >= end {
            return Err(PipelineError::InvalidRange { start, end });
        }

        let chunks = split_range(DateRange::new(start, end), self.max_span_days);
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(chunk, range)| self.build_task(key, range, chunk))
            .collect())
    }

    fn build_task(&self, key: &str, range: DateRange, chunk: usize) -> FetchTask {
        let end_inclusive = range.end - Duration::days(1);
        let values = [
            ("key", key.to_string()),
            ("start", range.start.format(DATE_FORMAT).to_string()),
            ("end", range.end.format(DATE_FORMAT).to_string()),
            ("end_inclusive", end_inclusive.format(DATE_FORMAT).to_string()),
        ];

        let mut params: BTreeMap<String, String> = values
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        for (name, value) in &self.extra_params {
            params.insert(name.clone(), value.clone());
        }

        let url = match self.method {
            HttpMethod::Get => {
                let mut url = format!("{}{}", self.base_url, substitute(&self.query_template, &values));
                if !self.extra_params.is_empty() {
                    url.push(if url.contains('?') { '&' } else { '?' });
                    url.push_str(&encode_pairs(&self.extra_params));
                }
                url
            }
            // POST bodies carry the parameters, the template only shapes the path
            HttpMethod::Post => {
                let path = self.query_template.split('?').next().unwrap_or_default();
                format!("{}{}", self.base_url, substitute(path, &values))
            }
        };

        FetchTask {
            key: key.to_string(),
            url,
            params,
            attempt: 0,
            method: self.method,
            range,
            chunk,
        }
    }
}

fn substitute(template: &str, values: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in values {
        let placeholder = format!("{{{}}}", name);
        out = out.replace(&placeholder, &urlencoding::encode(value));
    }
    out
}

fn encode_pairs(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn template() -> RequestTemplate {
        RequestTemplate {
            base_url: "https://api.example.com/v1".into(),
            query_template: "/series/{key}/observations?from={start}&to={end_inclusive}".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_empty_range() {
        let err = template().build_tasks("SPY", date(2024, 1, 5), date(2024, 1, 5)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRange { .. }));
    }

    #[test]
    fn test_splits_long_ranges() {
        let tasks = template().build_tasks("SPY", date(2024, 1, 1), date(2024, 3, 15)).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].range.start, date(2024, 1, 1));
        assert_eq!(tasks[2].range.end, date(2024, 3, 15));
        assert_eq!(tasks[1].chunk, 1);
        assert!(tasks[0].url.ends_with("from=2024-01-01&to=2024-01-30"));
    }

    #[test]
    fn test_unsafe_key_is_encoded() {
        let tasks = template().build_tasks("BRK/B &x=1?#", date(2024, 1, 1), date(2024, 1, 2)).unwrap();
        let url = &tasks[0].url;
        assert!(url.contains("/series/BRK%2FB%20%26x%3D1%3F%23/observations"));
        assert_eq!(url.matches('?').count(), 1);
        assert!(!url.contains('#'));
        assert_eq!(tasks[0].params["key"], "BRK/B &x=1?#");
    }

    #[test]
    fn test_extra_params_are_appended() {
        let mut t = template();
        t.extra_params.insert("api_key".into(), "a b".into());
        t.extra_params.insert("format".into(), "json".into());

        let tasks = t.build_tasks("SPY", date(2024, 1, 1), date(2024, 1, 2)).unwrap();
        assert!(tasks[0].url.ends_with("&api_key=a%20b&format=json"));
    }

    #[test]
    fn test_post_keeps_params_out_of_url() {
        let mut t = template();
        t.method = HttpMethod::Post;
        let tasks = t.build_tasks("SPY", date(2024, 1, 1), date(2024, 1, 2)).unwrap();
        assert_eq!(tasks[0].url, "https://api.example.com/v1/series/SPY/observations");
        assert_eq!(tasks[0].params["start"], "2024-01-01");
    }

    #[test]
    fn test_validate() {
        assert!(template().validate().is_ok());
        let mut t = template();
        t.query_template = "/series".into();
        assert!(t.validate().is_err());
        let mut t = template();
        t.base_url = "ftp://x".into();
        assert!(t.validate().is_err());
    }
}
