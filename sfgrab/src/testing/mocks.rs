//! Stand-in stages for runner and worker tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

use crate::context::{keys, Item};
use crate::core::{StageKind, StageOutput};
use crate::errors::PipelineError;
use crate::stages::Stage;

/// Succeeds for every item, remembering which identifiers it saw.
///
/// An optional delay keeps items in flight long enough for worker tests.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    delay: Option<Duration>,
    seen: Mutex<Vec<String>>,
}

impl RecordingStage {
    /// Creates a stage that returns immediately.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Sleeps for `delay` after recording each item.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Identifiers seen so far, in execution order.
    #[must_use]
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    /// Number of items executed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        self.seen.lock().push(item.name().to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(StageOutput::ok())
    }
}

/// Fails every item; `error` builds a fresh error per call.
pub struct FailingStage {
    name: String,
    error: Box<dyn Fn() -> PipelineError + Send + Sync>,
}

impl FailingStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        error: impl Fn() -> PipelineError + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            error: Box::new(error),
        }
    }
}

impl std::fmt::Debug for FailingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingStage")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _item: &mut Item) -> Result<StageOutput, PipelineError> {
        Err((self.error)())
    }
}

/// Skips the fetch: names the artifact and drops a finished WARC straight
/// into the data dir, as if staging, fetching and the move had all run.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinishedWarcStage;

/// Base name given to every artifact written by [`FinishedWarcStage`].
pub const FINISHED_WARC_BASE: &str = "sourceforge-test-20150614-120000";

#[async_trait]
impl Stage for FinishedWarcStage {
    fn name(&self) -> &str {
        "FinishedWarc"
    }

    fn kind(&self) -> StageKind {
        StageKind::Finalize
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        let data_dir = item.data_dir()?;
        let escaped = item.name().escaped();
        tokio::fs::write(data_dir.join(format!("{FINISHED_WARC_BASE}.warc.gz")), b"warc").await?;
        item.data.set_force(keys::ESCAPED_ITEM_NAME, escaped);
        item.data.set_force(keys::WARC_FILE_BASE, FINISHED_WARC_BASE);
        Ok(StageOutput::ok())
    }
}
