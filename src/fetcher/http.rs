use async_trait::async_trait;
use super::{HttpResponse, Transport};
use crate::error::FetchError;
use crate::models::{FetchTask, HttpMethod};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::Client;
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = "SeriesRollup/0.1";

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// `api_token` is sent as `Authorization: Token <token>` when present.
    pub fn new(api_token: Option<&str>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

        if let Some(token) = api_token.map(str::trim).filter(|t| !t.is_empty()) {
            if let Ok(auth_value) = HeaderValue::from_str(&format!("Token {}", token)) {
                headers.insert(AUTHORIZATION, auth_value);
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client }
    }

    fn classify(err: reqwest::Error, timeout: Duration) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(timeout)
        } else if err.is_builder() {
            FetchError::InvalidRequest(err.to_string())
        } else {
            // connect, reset, body read failures are all worth another try
            FetchError::Connection(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    fn name(&self) -> &str {
        "reqwest"
    }

    async fn send(&self, task: &FetchTask, timeout: Duration) -> Result<HttpResponse, FetchError> {
        let request = match task.method {
            HttpMethod::Get => self.client.get(&task.url),
            HttpMethod::Post => self.client.post(&task.url).form(&task.params),
        };

        let resp = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::classify(e, timeout))?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = resp.bytes().await.map_err(|e| Self::classify(e, timeout))?;

        Ok(HttpResponse { status, retry_after, body: body.to_vec() })
    }
}
