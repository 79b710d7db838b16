//! Sequential execution of a pipeline definition for one item.

use super::{with_retry, PipelineDefinition, RetryConfig};
use crate::context::Item;
use crate::coordinator::Coordinator;
use crate::core::StageStatus;
use crate::errors::PipelineError;
use crate::events::EventSink;
use crate::stages::discard_item_artifacts;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// What happened to one item that went through every stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    /// The item identifier.
    pub item: String,
    /// Stage names with the status each returned.
    pub stages: Vec<(String, StageStatus)>,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
}

/// Runs items through a [`PipelineDefinition`].
///
/// Stages run strictly in order. The first error stops the item; the
/// failure is logged and emitted as `item.failed`. The item's partial
/// artifacts are then discarded and the failure is reported to the
/// coordinator so the item is handed out again.
pub struct PipelineRunner {
    definition: Arc<PipelineDefinition>,
    coordinator: Arc<dyn Coordinator>,
    events: Arc<dyn EventSink>,
    retry: RetryConfig,
}

impl PipelineRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        definition: Arc<PipelineDefinition>,
        coordinator: Arc<dyn Coordinator>,
        events: Arc<dyn EventSink>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            definition,
            coordinator,
            events,
            retry,
        }
    }

    /// Returns the definition being executed.
    #[must_use]
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Runs every stage against `item`.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing stage, after the failure has
    /// been reported to the coordinator.
    pub async fn run(&self, item: &mut Item) -> Result<ItemReport, PipelineError> {
        let start = Instant::now();
        let mut stages = Vec::with_capacity(self.definition.stages().len());

        for stage in self.definition.stages() {
            let name = stage.name();
            self.events
                .emit(
                    "stage.started",
                    Some(json!({
                        "item": item.name().as_str(),
                        "stage": name,
                        "kind": stage.kind().to_string(),
                    })),
                )
                .await;

            let stage_start = Instant::now();
            match stage.execute(item).await {
                Ok(output) => {
                    let duration_ms = stage_start.elapsed().as_secs_f64() * 1000.0;
                    if output.is_skipped() {
                        self.events
                            .emit(
                                "stage.skipped",
                                Some(json!({
                                    "item": item.name().as_str(),
                                    "stage": name,
                                    "reason": output.skip_reason,
                                })),
                            )
                            .await;
                    } else {
                        self.events
                            .emit(
                                "stage.completed",
                                Some(json!({
                                    "item": item.name().as_str(),
                                    "stage": name,
                                    "duration_ms": duration_ms,
                                })),
                            )
                            .await;
                    }
                    stages.push((name.to_string(), output.status));
                }
                Err(error) => {
                    self.fail(item, name, &error).await;
                    return Err(error);
                }
            }
        }

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        item.log_output(format!("Finished {}.", item.name()));
        self.events
            .emit(
                "item.completed",
                Some(json!({"item": item.name().as_str(), "duration_ms": duration_ms})),
            )
            .await;

        Ok(ItemReport {
            item: item.name().to_string(),
            stages,
            duration_ms,
        })
    }

    async fn fail(&self, item: &mut Item, stage: &str, error: &PipelineError) {
        item.log_output(format!("Stage {stage} failed: {error}"));
        tracing::error!(
            item = %item.name(),
            attempt = %item.attempt_id(),
            stage,
            kind = error.kind(),
            error = %error,
            "Item failed"
        );
        self.events
            .emit(
                "item.failed",
                Some(json!({
                    "item": item.name().as_str(),
                    "stage": stage,
                    "kind": error.kind(),
                    "error": error.to_string(),
                })),
            )
            .await;

        match discard_item_artifacts(item).await {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!(item = %item.name(), removed = removed.len(), "Discarded artifacts of failed item");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(item = %item.name(), error = %e, "Could not discard artifacts of failed item");
            }
        }

        let reason = format!("{stage}: {error}");
        let name = item.name().to_string();
        let provenance = item.provenance().clone();
        let reported = report_failure(
            &*self.coordinator,
            &self.retry,
            &name,
            &provenance.downloader,
            &provenance.version,
            &reason,
        )
        .await;
        if let Err(e) = reported {
            tracing::error!(item = %name, error = %e, "Could not report failed item");
        }
    }
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("pipeline", &self.definition.name())
            .field("stages", &self.definition.stage_names())
            .finish_non_exhaustive()
    }
}

/// Tells the coordinator that `item` was abandoned.
///
/// # Errors
///
/// Returns the coordinator error once retries are exhausted.
pub async fn report_failure(
    coordinator: &dyn Coordinator,
    retry: &RetryConfig,
    item: &str,
    downloader: &str,
    version: &str,
    reason: &str,
) -> Result<(), PipelineError> {
    with_retry(retry, "fail_item", PipelineError::is_retryable, move || {
        coordinator.fail_item(item, downloader, version, reason)
    })
    .await
}
