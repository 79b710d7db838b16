//! The claim loop keeping several items in flight.

use super::runner::report_failure;
use super::{with_retry, PipelineRunner};
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::context::{Item, ItemName, Provenance};
use crate::coordinator::Coordinator;
use crate::errors::PipelineError;
use crate::events::EventSink;
use crate::utils::iso_timestamp;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Counts of what a worker run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Items claimed from the coordinator.
    pub claimed: usize,
    /// Items that finished every stage.
    pub completed: usize,
    /// Items that failed and were reported.
    pub failed: usize,
}

/// Claims items and runs each on its own task.
///
/// At most `concurrent_items` items are in flight. The loop ends when the
/// cancellation token fires, when `max_items` claims have been made, or on
/// the first environment error; in-flight items always run to completion.
pub struct Worker {
    config: Arc<PipelineConfig>,
    coordinator: Arc<dyn Coordinator>,
    runner: Arc<PipelineRunner>,
    events: Arc<dyn EventSink>,
    shutdown: Arc<CancellationToken>,
    max_items: Option<usize>,
}

impl Worker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        config: Arc<PipelineConfig>,
        coordinator: Arc<dyn Coordinator>,
        runner: Arc<PipelineRunner>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            coordinator,
            runner,
            events,
            shutdown: Arc::new(CancellationToken::new()),
            max_items: None,
        }
    }

    /// Stops claiming after `max_items` items.
    #[must_use]
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    /// Uses an externally owned shutdown token.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Arc<CancellationToken>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Returns the token that stops the claim loop.
    #[must_use]
    pub fn shutdown_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.shutdown)
    }

    /// Runs the claim loop.
    ///
    /// # Errors
    ///
    /// Returns the first environment error after in-flight items drain.
    pub async fn run(&self) -> Result<WorkerSummary, PipelineError> {
        let slots = self.config.concurrent_items.max(1);
        let mut summary = WorkerSummary::default();
        let mut in_flight: JoinSet<Result<(), PipelineError>> = JoinSet::new();
        let mut fatal: Option<PipelineError> = None;

        tracing::info!(
            pipeline = %self.runner.definition().name(),
            version = %self.runner.definition().version(),
            downloader = %self.config.downloader,
            slots,
            "Worker started"
        );

        loop {
            let claiming = fatal.is_none()
                && !self.shutdown.is_cancelled()
                && self.max_items.map_or(true, |max| summary.claimed < max);

            if claiming && in_flight.len() < slots {
                match self.claim().await {
                    Ok(Some(name)) => {
                        summary.claimed += 1;
                        self.spawn_item(&mut in_flight, name, &mut summary).await;
                        continue;
                    }
                    Ok(None) if in_flight.is_empty() => {
                        tracing::info!(delay_secs = self.config.idle_delay_secs, "No item received, waiting");
                        tokio::select! {
                            () = tokio::time::sleep(self.config.idle_delay()) => {}
                            () = self.shutdown.cancelled() => {}
                        }
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not claim an item");
                        if in_flight.is_empty() {
                            tokio::select! {
                                () = tokio::time::sleep(self.config.idle_delay()) => {}
                                () = self.shutdown.cancelled() => {}
                            }
                            continue;
                        }
                    }
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                if claiming {
                    continue;
                }
                break;
            };

            match joined {
                Ok(Ok(())) => summary.completed += 1,
                Ok(Err(e)) => {
                    summary.failed += 1;
                    if e.is_fatal_for_run() && fatal.is_none() {
                        tracing::error!(error = %e, "Environment is unusable, no more items will be claimed");
                        self.shutdown.cancel(e.to_string());
                        fatal = Some(e);
                    }
                }
                Err(join_error) => {
                    summary.failed += 1;
                    tracing::error!(error = %join_error, "Item task panicked");
                }
            }
        }

        tracing::info!(
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed,
            "Worker stopped"
        );
        self.events.try_emit(
            "worker.stopped",
            Some(json!({
                "claimed": summary.claimed,
                "completed": summary.completed,
                "failed": summary.failed,
                "reason": self.shutdown.reason(),
            })),
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn claim(&self) -> Result<Option<String>, PipelineError> {
        let coordinator = &*self.coordinator;
        let (downloader, version) = (self.config.downloader.as_str(), self.config.version.as_str());
        with_retry(
            &self.config.coordinator_retry,
            "request_item",
            PipelineError::is_retryable,
            move || coordinator.request_item(downloader, version),
        )
        .await
    }

    async fn spawn_item(
        &self,
        in_flight: &mut JoinSet<Result<(), PipelineError>>,
        raw: String,
        summary: &mut WorkerSummary,
    ) {
        let name = match ItemName::parse(raw.clone()) {
            Ok(name) => name,
            Err(e) => {
                summary.failed += 1;
                tracing::error!(item = %raw, error = %e, "Coordinator handed out a malformed item");
                let reported = report_failure(
                    &*self.coordinator,
                    &self.config.coordinator_retry,
                    &raw,
                    &self.config.downloader,
                    &self.config.version,
                    &e.to_string(),
                )
                .await;
                if let Err(report_error) = reported {
                    tracing::error!(item = %raw, error = %report_error, "Could not report failed item");
                }
                return;
            }
        };

        let provenance = Provenance::new(
            self.config.downloader.clone(),
            self.config.version.clone(),
            self.runner.definition().definition_hash(),
        );
        let mut item = Item::new(name, &self.config.data_dir, provenance);
        item.log_output(format!("Received item '{raw}' from tracker"));
        self.events
            .emit(
                "item.claimed",
                Some(json!({
                    "item": raw,
                    "attempt": item.attempt_id().to_string(),
                    "claimed_at": iso_timestamp(),
                })),
            )
            .await;

        let runner = Arc::clone(&self.runner);
        in_flight.spawn(async move { runner.run(&mut item).await.map(|_| ()) });
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("runner", &self.runner)
            .field("max_items", &self.max_items)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::pipeline::{JitterStrategy, PipelineDefinition, RetryConfig};
    use crate::testing::{FailingStage, InMemoryCoordinator, RecordingStage};
    use std::time::Duration;

    fn config() -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig {
            concurrent_items: 2,
            idle_delay_secs: 0.01,
            coordinator_retry: RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay_ms(1)
                .with_jitter(JitterStrategy::None),
            ..PipelineConfig::default()
        })
    }

    fn worker(definition: PipelineDefinition, coordinator: Arc<InMemoryCoordinator>) -> Worker {
        let config = config();
        let events = Arc::new(CollectingEventSink::new());
        let runner = Arc::new(PipelineRunner::new(
            Arc::new(definition),
            coordinator.clone(),
            events.clone(),
            config.coordinator_retry.clone(),
        ));
        Worker::new(config, coordinator, runner, events)
    }

    #[tokio::test]
    async fn test_processes_claimed_items() {
        let coordinator = Arc::new(InMemoryCoordinator::with_items(["project:a", "project:b", "project:c"]));
        let stage = Arc::new(RecordingStage::new("work"));
        let definition = PipelineDefinition::new("test", "1").with_shared_stage(stage.clone());

        let summary = worker(definition, coordinator.clone())
            .with_max_items(3)
            .run()
            .await
            .unwrap();

        assert_eq!(summary, WorkerSummary { claimed: 3, completed: 3, failed: 0 });
        assert_eq!(stage.call_count(), 3);
    }

    #[tokio::test]
    async fn test_malformed_item_is_reported_not_run() {
        let coordinator = Arc::new(InMemoryCoordinator::with_items(["nodelimiter"]));
        let stage = Arc::new(RecordingStage::new("work"));
        let definition = PipelineDefinition::new("test", "1").with_shared_stage(stage.clone());

        let summary = worker(definition, coordinator.clone())
            .with_max_items(1)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(stage.call_count(), 0);
        assert_eq!(coordinator.failed()[0].0, "nodelimiter");
    }

    #[tokio::test]
    async fn test_environment_error_stops_claiming() {
        let coordinator = Arc::new(InMemoryCoordinator::with_items(["project:a", "project:b", "project:c", "project:d"]));
        let definition = PipelineDefinition::new("test", "1").with_stage(FailingStage::new(
            "CheckIP",
            || PipelineError::Environment("proxy".into()),
        ));

        let err = worker(definition, coordinator.clone()).run().await.unwrap_err();
        assert!(err.is_fatal_for_run());
        assert!(coordinator.remaining() >= 1);
        assert!(!coordinator.failed().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_worker() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let definition = PipelineDefinition::new("test", "1").with_stage(RecordingStage::new("work"));
        let worker = worker(definition, coordinator);
        let token = worker.shutdown_token();

        let handle = tokio::spawn(async move { worker.run().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel("test over");

        let summary = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.claimed, 0);
    }

    #[tokio::test]
    async fn test_in_flight_items_finish_after_shutdown() {
        let coordinator = Arc::new(InMemoryCoordinator::with_items(["project:a", "project:b", "project:c"]));
        let definition =
            PipelineDefinition::new("test", "1")
                .with_stage(RecordingStage::new("slow").with_delay(Duration::from_millis(50)));
        let worker = worker(definition, coordinator.clone());
        let token = worker.shutdown_token();

        let handle = tokio::spawn(async move { worker.run().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("test over");

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary, WorkerSummary { claimed: 2, completed: 2, failed: 0 });
        assert_eq!(coordinator.remaining(), 1);
    }
}
