//! Client side of the work-queue coordinator ("tracker") protocol.
//!
//! The coordinator hands out item identifiers, tells the worker where to
//! upload, and records completion or failure. It is the single authority
//! on work assignment; duplicate `done` signals are safe.

mod http;

pub use http::HttpCoordinator;

use crate::errors::PipelineError;
use async_trait::async_trait;

/// Operations the worker performs against the coordinator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Claims the next item. `Ok(None)` means there is no work right now.
    async fn request_item(
        &self,
        downloader: &str,
        version: &str,
    ) -> Result<Option<String>, PipelineError>;

    /// Asks where the finished files of `item` should be pushed.
    async fn upload_target(
        &self,
        item: &str,
        downloader: &str,
        version: &str,
    ) -> Result<String, PipelineError>;

    /// Reports completion with the prepared stats payload.
    async fn send_done(&self, item: &str, stats: &serde_json::Value) -> Result<(), PipelineError>;

    /// Abandons an item so the coordinator can hand it out again.
    async fn fail_item(
        &self,
        item: &str,
        downloader: &str,
        version: &str,
        reason: &str,
    ) -> Result<(), PipelineError>;
}

impl std::fmt::Debug for dyn Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Coordinator")
    }
}
