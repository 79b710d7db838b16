//! Pipeline definition and execution.
//!
//! This module provides:
//! - The fixed stage sequence ([`PipelineDefinition`], [`default_pipeline`])
//! - Per-item sequential execution ([`PipelineRunner`])
//! - The claim loop keeping several items in flight ([`Worker`])
//! - Bounded retry with backoff for coordinator calls

mod definition;
mod retry;
mod runner;
mod worker;

pub use definition::{default_pipeline, PipelineDefinition};
pub use retry::{
    should_retry, with_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision,
};
pub use runner::{report_failure, ItemReport, PipelineRunner};
pub use worker::{Worker, WorkerSummary};
