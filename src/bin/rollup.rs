use anyhow::Context;
use series_rollup_lib::fetcher::http::ReqwestTransport;
use series_rollup_lib::{cancel_pair, Pipeline, PipelineConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Config file as the first argument, otherwise ROLLUP_* variables
    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_json_file(&PathBuf::from(path))?,
        None => PipelineConfig::from_env()?,
    };

    let transport = Arc::new(ReqwestTransport::new(config.api_token.as_deref()));
    let value_fields = config.parser.value_fields.clone();
    let pipeline = Pipeline::new(config, transport).context("invalid configuration")?;

    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight requests");
            handle.cancel();
        }
    });

    let table = pipeline.run(token).await?;

    let output = serde_json::json!({
        "rows": table.rows(&value_fields),
        "failures": table.failures,
        "skipped": table.skipped,
        "cancelled": table.cancelled,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
