//! Core domain model types for sfgrab.
//!
//! This module contains the fundamental types returned by stages:
//! - Stage status and kind enums
//! - Stage output type with factory methods

mod output;
mod status;

pub use output::StageOutput;
pub use status::{StageKind, StageStatus};
