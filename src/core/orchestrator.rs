use crate::analysis::aggregator::Aggregator;
use crate::analysis::assembler::ResultAssembler;
use crate::config::PipelineConfig;
use crate::core::cancel::CancelToken;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::fetcher::pool::FetchPool;
use crate::fetcher::Transport;
use crate::models::{FetchResult, FetchTask, ResultTable};
use crate::parser::ResponseParser;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One configured fetch-parse-aggregate run.
pub struct Pipeline {
    config: PipelineConfig,
    transport: Arc<dyn Transport>,
    parser: ResponseParser,
}

impl Pipeline {
    /// Fails only on configuration errors; nothing has been fetched yet.
    pub fn new(config: PipelineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let parser = ResponseParser::new(config.parser.clone())?;
        Ok(Self { config, transport, parser })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run to completion (or cancellation) and assemble the table.
    ///
    /// Per-key problems end up in `ResultTable::failures`; the only errors
    /// returned here are aggregation invariant violations and a pool that died.
    pub async fn run(&self, cancel: CancelToken) -> Result<ResultTable> {
        let cancel = match self.config.run_deadline_ms {
            Some(ms) => cancel.with_deadline(tokio::time::Instant::now() + Duration::from_millis(ms)),
            None => cancel,
        };

        let range = self.config.range();
        let mut assembler = ResultAssembler::new();
        let mut aggregator = Aggregator::new(self.config.granularity, range);

        let keys: BTreeSet<&String> = self.config.keys.iter().collect();
        let mut tasks: Vec<FetchTask> = Vec::new();
        for key in keys {
            match self.config.request.build_tasks(key, range.start, range.end) {
                Ok(built) => tasks.extend(built),
                Err(e @ PipelineError::InvalidRange { .. }) => {
                    warn!(key = %key, "not fetching: {}", e);
                    assembler.record_failure(key, range, ErrorKind::InvalidRange, e.to_string(), 0);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            keys = self.config.keys.len(),
            tasks = tasks.len(),
            granularity = ?self.config.granularity,
            "pipeline starting for {} .. {}",
            range.start,
            range.end
        );

        let pool = FetchPool::new(
            Arc::clone(&self.transport),
            self.config.max_concurrency,
            self.config.retry_policy(),
            self.config.request_timeout(),
        );
        let (tx, mut rx) = mpsc::channel::<FetchResult>(self.config.max_concurrency * 2);
        let pool_cancel = cancel.clone();
        let pool_handle = tokio::spawn(async move { pool.run(tasks, pool_cancel, tx).await });

        // Single writer: every result is parsed and folded here, in arrival order.
        let mut received = 0usize;
        while let Some(result) = rx.recv().await {
            received += 1;
            if let Err(e) = self.absorb(result, &mut aggregator, &mut assembler) {
                pool_handle.abort();
                return Err(e);
            }
        }

        let submitted = pool_handle
            .await
            .map_err(|e| PipelineError::Pool(e.to_string()))?;
        if submitted != received {
            return Err(PipelineError::Pool(format!("{} tasks submitted, {} results received", submitted, received)));
        }

        if cancel.is_cancelled() {
            assembler.mark_cancelled();
        }

        let buckets = aggregator.finalize()?;
        let table = assembler.assemble(buckets);

        info!(
            buckets = table.buckets.len(),
            failures = table.failures.len(),
            skipped = table.skipped.len(),
            cancelled = table.cancelled,
            "pipeline finished"
        );
        Ok(table)
    }

    fn absorb(
        &self,
        result: FetchResult,
        aggregator: &mut Aggregator,
        assembler: &mut ResultAssembler,
    ) -> Result<()> {
        let payload = match (&result.error, result.payload) {
            (None, Some(payload)) => payload,
            (error, _) => {
                let (kind, message) = match error {
                    Some(err) => (err.kind(), err.to_string()),
                    None => (ErrorKind::TerminalFetch, "failed without an error".to_string()),
                };
                assembler.record_failure(&result.key, result.range, kind, message, result.attempts);
                return Ok(());
            }
        };

        let outcome = match self.parser.parse(&result.key, &payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(key = %result.key, chunk = result.chunk, "unusable payload: {}", e);
                assembler.record_failure(&result.key, result.range, ErrorKind::Parse, e.to_string(), result.attempts);
                return Ok(());
            }
        };

        assembler.record_success(&result.key);
        aggregator.touch(&result.key);

        let range = self.config.range();
        let mut folded = 0usize;
        for record in &outcome.records {
            if aggregator.fold(record)? {
                folded += 1;
            } else {
                assembler.record_skip(
                    &result.key,
                    result.chunk,
                    format!("timestamp {} outside [{}, {})", record.timestamp, range.start, range.end),
                );
            }
        }
        for skip in outcome.skipped {
            assembler.record_skip(&result.key, result.chunk, skip.to_string());
        }

        debug!(
            key = %result.key,
            chunk = result.chunk,
            attempts = result.attempts,
            latency_ms = result.latency.as_millis() as u64,
            records = outcome.records.len(),
            folded,
            soft_misses = outcome.soft_misses,
            "absorbed result"
        );
        Ok(())
    }
}

/// Validate, run, and assemble in one call.
pub async fn run_pipeline(
    config: PipelineConfig,
    transport: Arc<dyn Transport>,
    cancel: CancelToken,
) -> Result<ResultTable> {
    Pipeline::new(config, transport)?.run(cancel).await
}
