use async_trait::async_trait;
use crate::error::FetchError;
use crate::models::FetchTask;
use std::time::Duration;

pub mod http;
pub mod pool;
pub mod request;

/// Raw upstream response, before any status classification.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self { status: 200, retry_after: None, body: body.into() }
    }

    pub fn status(status: u16) -> Self {
        Self { status, retry_after: None, body: Vec::new() }
    }
}

/// Sends one attempt of a task. Implementations only report what happened on
/// the wire; retry and status policy live in the pool.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, task: &FetchTask, timeout: Duration) -> Result<HttpResponse, FetchError>;
}
