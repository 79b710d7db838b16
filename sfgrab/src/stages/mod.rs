//! Stage trait and implementations.
//!
//! Stages are the fundamental units of work in a pipeline. Each one receives
//! the item's context exclusively and either returns a [`StageOutput`] or a
//! [`PipelineError`] that stops the item.

mod check_ip;
mod external;
mod finalize;
mod limit;
mod prepare;
mod tracker;
mod wget;

pub use check_ip::{CheckIp, HostResolver, SystemResolver};
pub use external::{ArgsRealizer, ExternalProcess, Invocation, ProcessOutcome, ProcessPolicy, TemplateArgs};
pub use finalize::{discard_item_artifacts, verify_compressed_artifact, MoveFiles};
pub use limit::{ConcurrencyLimiter, ConcurrencyToken, LimitConcurrent};
pub use prepare::PrepareDirectories;
pub use tracker::{PrepareStatsForTracker, SendDoneToTracker, UploadWithTracker};
pub use wget::{WgetArgs, WgetDownload, WGET_ACCEPTED_EXIT_CODES};

use crate::context::Item;
use crate::core::{StageKind, StageOutput};
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage, used in logs and events.
    fn name(&self) -> &str;

    /// Returns the kind of work the stage performs.
    fn kind(&self) -> StageKind {
        StageKind::default()
    }

    /// Describes the settings that shape what the stage does.
    ///
    /// Folded into the pipeline definition hash, so it must not depend on
    /// runtime state or on machine-specific paths.
    fn fingerprint(&self) -> String {
        String::new()
    }

    /// Executes the stage against one item.
    ///
    /// # Errors
    ///
    /// Any error stops the item's remaining stages.
    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError>;
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&mut Item) -> Result<StageOutput, PipelineError> + Send + Sync,
{
    name: String,
    kind: StageKind,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&mut Item) -> Result<StageOutput, PipelineError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::default(),
            func,
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&mut Item) -> Result<StageOutput, PipelineError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&mut Item) -> Result<StageOutput, PipelineError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        (self.func)(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_item;

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("mark", |item: &mut Item| {
            item.data.set_force("marked", true);
            Ok(StageOutput::ok())
        })
        .with_kind(StageKind::Prepare);

        assert_eq!(stage.name(), "mark");
        assert_eq!(stage.kind(), StageKind::Prepare);

        let mut item = test_item("project:foo", "/tmp");
        let output = stage.execute(&mut item).await.unwrap();
        assert!(output.is_ok());
        assert_eq!(item.data.get("marked"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn test_fn_stage_error() {
        let stage = FnStage::new("boom", |_item: &mut Item| {
            Err(PipelineError::Environment("nope".into()))
        });
        let mut item = test_item("project:foo", "/tmp");
        assert!(stage.execute(&mut item).await.is_err());
    }
}
