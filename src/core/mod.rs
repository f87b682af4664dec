pub mod calendar;
pub mod cancel;
pub mod orchestrator;
pub mod rate_limiter;
