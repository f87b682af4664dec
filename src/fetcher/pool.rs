use super::{HttpResponse, Transport};
use crate::core::cancel::CancelToken;
use crate::core::rate_limiter::{parse_retry_after, RetryPolicy};
use crate::error::FetchError;
use crate::models::{FetchResult, FetchTask};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ERROR_BODY_PREVIEW: usize = 200;

/// Spawned workers, aborted when dropped so an abandoned run stops issuing requests.
struct Workers(Vec<(FetchTask, Arc<AtomicU32>, JoinHandle<()>)>);

impl Drop for Workers {
    fn drop(&mut self) {
        for (_, _, handle) in &self.0 {
            handle.abort();
        }
    }
}

/// Bounded-concurrency executor for fetch tasks.
///
/// A semaphore permit is held only while a request is on the wire, so at most
/// `max_concurrency` requests are outstanding at once; backoff sleeps do not
/// occupy a slot.
pub struct FetchPool {
    transport: Arc<dyn Transport>,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl FetchPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        max_concurrency: usize,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            policy,
            request_timeout,
        }
    }

    /// Run every task and push exactly one `FetchResult` per task into `tx`.
    /// Returns after all tasks resolved. A panicking task is reported as a
    /// failure for that task only.
    pub async fn run(&self, tasks: Vec<FetchTask>, cancel: CancelToken, tx: mpsc::Sender<FetchResult>) -> usize {
        let total = tasks.len();
        info!(
            transport = self.transport.name(),
            tasks = total,
            permits = self.semaphore.available_permits(),
            "fetch pool starting"
        );

        let mut workers = Workers(Vec::with_capacity(total));
        for task in tasks {
            let worker = Worker {
                transport: Arc::clone(&self.transport),
                semaphore: Arc::clone(&self.semaphore),
                policy: self.policy.clone(),
                request_timeout: self.request_timeout,
            };
            let cancel = cancel.clone();
            let tx = tx.clone();
            let spawned = task.clone();
            let attempts = Arc::new(AtomicU32::new(task.attempt));
            let counter = Arc::clone(&attempts);
            let handle = tokio::spawn(async move {
                let result = worker.execute(spawned, cancel, counter).await;
                // receiver gone means the consumer stopped listening, nothing to do
                let _ = tx.send(result).await;
            });
            workers.0.push((task, attempts, handle));
        }

        let mut panicked = 0;
        for (task, attempts, handle) in workers.0.iter_mut() {
            if let Err(join_err) = handle.await {
                panicked += 1;
                let reason = if join_err.is_panic() { "task panicked" } else { "task aborted" };
                warn!(key = %task.key, chunk = task.chunk, "{}: {}", reason, join_err);
                let result = FetchResult::failure(
                    &task,
                    FetchError::Panicked(join_err.to_string()),
                    // the attempt in progress when the task died counts
                    attempts.load(Ordering::SeqCst).max(1),
                    Duration::ZERO,
                );
                let _ = tx.send(result).await;
            }
        }

        info!(tasks = total, panicked, "fetch pool drained");
        total
    }
}

struct Worker {
    transport: Arc<dyn Transport>,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl Worker {
    async fn execute(&self, task: FetchTask, cancel: CancelToken, made: Arc<AtomicU32>) -> FetchResult {
        let started = Instant::now();
        let mut attempts = task.attempt;

        loop {
            if cancel.is_cancelled() {
                debug!(key = %task.key, chunk = task.chunk, "cancelled before attempt {}", attempts + 1);
                return FetchResult::failure(&task, FetchError::Cancelled { attempt: attempts + 1 }, attempts, started.elapsed());
            }

            let outcome = {
                let permit = tokio::select! {
                    permit = self.semaphore.acquire() => permit,
                    _ = cancel.cancelled() => {
                        return FetchResult::failure(&task, FetchError::Cancelled { attempt: attempts + 1 }, attempts, started.elapsed());
                    }
                };
                let _permit = match permit {
                    Ok(p) => p,
                    Err(_) => {
                        return FetchResult::failure(
                            &task,
                            FetchError::InvalidRequest("fetch pool closed".into()),
                            attempts,
                            started.elapsed(),
                        );
                    }
                };
                attempts += 1;
                made.store(attempts, Ordering::SeqCst);
                self.attempt_once(&task).await
            };

            match outcome {
                Ok(body) => {
                    debug!(key = %task.key, chunk = task.chunk, attempts, bytes = body.len(), "fetched");
                    return FetchResult::success(&task, body, attempts, started.elapsed());
                }
                Err(err) => {
                    if !self.policy.should_retry(attempts, &err) {
                        warn!(key = %task.key, chunk = task.chunk, attempts, "giving up: {}", err);
                        return FetchResult::failure(&task, err, attempts, started.elapsed());
                    }

                    let delay = self.policy.delay_for(attempts - 1, &err);
                    debug!(
                        key = %task.key,
                        chunk = task.chunk,
                        "attempt {}/{} failed ({}), retrying in {:?}",
                        attempts,
                        self.policy.max_attempts,
                        err,
                        delay
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            debug!(key = %task.key, chunk = task.chunk, "cancelled during backoff after: {}", err);
                            return FetchResult::failure(&task, FetchError::Cancelled { attempt: attempts + 1 }, attempts, started.elapsed());
                        }
                    }
                }
            }
        }
    }

    async fn attempt_once(&self, task: &FetchTask) -> Result<Vec<u8>, FetchError> {
        let timeout = self.request_timeout;
        let response = match tokio::time::timeout(timeout, self.transport.send(task, timeout)).await {
            Ok(res) => res?,
            Err(_) => return Err(FetchError::Timeout(timeout)),
        };
        classify_response(response)
    }
}

/// Map an HTTP status onto success, transient or terminal.
pub fn classify_response(response: HttpResponse) -> Result<Vec<u8>, FetchError> {
    match response.status {
        200..=299 => Ok(response.body),
        429 => {
            let retry_after = response
                .retry_after
                .as_deref()
                .and_then(|v| parse_retry_after(v, chrono::Utc::now()));
            Err(FetchError::RateLimited { retry_after })
        }
        500..=599 => Err(FetchError::Server { status: response.status, body: preview(&response.body) }),
        status => Err(FetchError::Client { status, body: preview(&response.body) }),
    }
}

fn preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.chars().take(ERROR_BODY_PREVIEW).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rate_limiter::BackoffConfig;
    use crate::models::{DateRange, HttpMethod};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    struct Flaky {
        calls: AtomicUsize,
        panic_on: Option<usize>,
    }

    #[async_trait]
    impl Transport for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _task: &FetchTask, _timeout: Duration) -> Result<HttpResponse, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on == Some(call) {
                panic!("transport blew up on call {}", call);
            }
            Ok(HttpResponse::status(503))
        }
    }

    fn task(key: &str) -> FetchTask {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        FetchTask {
            key: key.into(),
            url: format!("http://upstream.test/{}", key),
            params: BTreeMap::new(),
            attempt: 0,
            method: HttpMethod::Get,
            range: DateRange::new(start, start.succ_opt().unwrap()),
            chunk: 0,
        }
    }

    fn pool(transport: Arc<Flaky>, max_attempts: u32, base_delay_ms: u64) -> FetchPool {
        let backoff = BackoffConfig { base_delay_ms, max_delay_ms: base_delay_ms, max_retry_after_ms: base_delay_ms, jitter_ms: 0 };
        FetchPool::new(transport, 2, RetryPolicy::new(max_attempts, backoff), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_panic_reports_attempts_made() {
        let transport = Arc::new(Flaky { calls: AtomicUsize::new(0), panic_on: Some(2) });
        let (tx, mut rx) = mpsc::channel(4);

        let sent = pool(Arc::clone(&transport), 5, 1).run(vec![task("A")], CancelToken::never(), tx).await;
        assert_eq!(sent, 1);

        let result = rx.recv().await.unwrap();
        assert!(matches!(result.error, Some(FetchError::Panicked(_))));
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_dropping_the_pool_run_stops_workers() {
        let transport = Arc::new(Flaky { calls: AtomicUsize::new(0), panic_on: None });
        let (tx, _rx) = mpsc::channel(4);

        let pool = pool(Arc::clone(&transport), 1_000, 5);
        let driver = tokio::spawn(async move { pool.run(vec![task("A"), task("B")], CancelToken::never(), tx).await });
        tokio::time::sleep(Duration::from_millis(40)).await;
        driver.abort();
        let _ = driver.await;

        let after_abort = transport.calls.load(Ordering::SeqCst);
        assert!(after_abort > 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), after_abort);
    }

    #[test]
    fn test_classify_statuses() {
        assert_eq!(classify_response(HttpResponse::ok("[]")), Ok(b"[]".to_vec()));
        assert!(matches!(
            classify_response(HttpResponse::status(503)),
            Err(FetchError::Server { status: 503, .. })
        ));
        assert!(matches!(
            classify_response(HttpResponse::status(404)),
            Err(FetchError::Client { status: 404, .. })
        ));

        let limited = HttpResponse { status: 429, retry_after: Some("3".into()), body: Vec::new() };
        assert_eq!(
            classify_response(limited),
            Err(FetchError::RateLimited { retry_after: Some(Duration::from_secs(3)) })
        );
    }

    #[test]
    fn test_error_body_is_truncated() {
        let resp = HttpResponse { status: 400, retry_after: None, body: vec![b'x'; 1000] };
        match classify_response(resp) {
            Err(FetchError::Client { body, .. }) => assert_eq!(body.len(), ERROR_BODY_PREVIEW),
            other => panic!("unexpected {:?}", other),
        }
    }
}
