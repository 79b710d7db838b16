//! # sfgrab
//!
//! An archival worker: it claims items from a tracker, fetches each one
//! into a WARC file with an external recursive fetcher, uploads the result
//! and reports back.
//!
//! Every item runs through the same fixed sequence of stages:
//!
//! - **Environment guard**: refuse to run behind a DNS-collapsing proxy
//! - **Local staging**: a fresh per-item directory and derived file names
//! - **Transfer**: the fetcher, with an exit-code allow-list and bounded retries
//! - **Finalization**: artifact checks, move, stats, upload, done signal
//!
//! Uploads are gated by a process-wide [`stages::ConcurrencyLimiter`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sfgrab::prelude::*;
//! use std::sync::Arc;
//!
//! let config = Arc::new(PipelineConfig::from_file("config.json")?);
//! let coordinator: Arc<dyn Coordinator> = Arc::new(HttpCoordinator::new(config.tracker_url())?);
//! let limiter = ConcurrencyLimiter::new("shared:rsync_threads", config.upload_slots())?;
//! let definition = default_pipeline(&config, &coordinator, &limiter, Arc::new(SystemResolver));
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{NumberConfigValue, PipelineConfig};
    pub use crate::context::{keys, Item, ItemName, ItemTemplate, ItemType, Provenance};
    pub use crate::coordinator::{Coordinator, HttpCoordinator};
    pub use crate::core::{StageKind, StageOutput, StageStatus};
    pub use crate::errors::{ConfigError, PipelineError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        default_pipeline, PipelineDefinition, PipelineRunner, RetryConfig, Worker,
    };
    pub use crate::stages::{ConcurrencyLimiter, Stage, SystemResolver};
}
