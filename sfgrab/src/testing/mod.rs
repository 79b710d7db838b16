//! Testing utilities for sfgrab pipelines.
//!
//! This module provides:
//! - Stand-in stages
//! - Fixtures (items, a static resolver, an in-memory coordinator)
//! - Assertions for stage outputs

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_output_metadata, assert_output_ok, assert_output_skipped};
pub use fixtures::{test_item, InMemoryCoordinator, StaticResolver};
pub use mocks::{FailingStage, FinishedWarcStage, RecordingStage, FINISHED_WARC_BASE};
