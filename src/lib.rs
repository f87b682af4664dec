//! Concurrent fetch and calendar-window aggregation of keyed time series.
//!
//! A run turns a [`config::PipelineConfig`] into a [`models::ResultTable`]:
//! requests are built per key and sub-range, executed by a bounded worker
//! pool, parsed into normalized records, folded into calendar windows and
//! assembled together with an explicit list of what failed.

pub mod analysis;
pub mod config;
pub mod core;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod parser;

pub use crate::config::PipelineConfig;
pub use crate::core::calendar::Granularity;
pub use crate::core::cancel::{cancel_pair, CancelHandle, CancelToken};
pub use crate::core::orchestrator::{run_pipeline, Pipeline};
pub use crate::error::{ErrorKind, FetchError, ParseError, PipelineError};
pub use crate::models::ResultTable;
