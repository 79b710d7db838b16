//! Process-wide concurrency gate around a group of stages.
//!
//! A [`ConcurrencyLimiter`] is created once and shared by every item. The
//! capacity can be changed while the worker runs; lowering it never revokes
//! held tokens, it only makes new acquirers wait until `held < capacity`.

use super::Stage;
use crate::config::{PipelineConfig, RSYNC_THREADS_MAX, RSYNC_THREADS_MIN};
use crate::context::Item;
use crate::core::{StageKind, StageOutput};
use crate::errors::{ConfigError, PipelineError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug)]
struct LimiterState {
    capacity: usize,
    held: usize,
    peak: usize,
}

/// A counting gate with an adjustable capacity.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    name: String,
    state: Mutex<LimiterState>,
    notify: Notify,
}

impl ConcurrencyLimiter {
    /// Creates a limiter.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::OutOfRange` unless `1 <= capacity <= 4`.
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Arc<Self>, ConfigError> {
        let name = name.into();
        check_capacity(&name, capacity)?;
        Ok(Arc::new(Self {
            name,
            state: Mutex::new(LimiterState {
                capacity,
                held: 0,
                peak: 0,
            }),
            notify: Notify::new(),
        }))
    }

    /// Returns the limiter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Changes the capacity and wakes waiters.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::OutOfRange` unless `1 <= capacity <= 4`.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), ConfigError> {
        check_capacity(&self.name, capacity)?;
        self.state.lock().capacity = capacity;
        tracing::info!(limiter = %self.name, capacity, "Concurrency limit changed");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Re-reads `rsync_threads` from a configuration file and applies it.
    ///
    /// Returns the capacity now in effect.
    ///
    /// # Errors
    ///
    /// Returns the load or validation error; the capacity is left unchanged.
    pub fn reload_capacity(&self, path: impl AsRef<Path>) -> Result<usize, PipelineError> {
        let capacity = PipelineConfig::from_file(path)?.upload_slots();
        self.set_capacity(capacity)?;
        Ok(capacity)
    }

    /// Waits for a free slot.
    pub async fn acquire(self: &Arc<Self>) -> ConcurrencyToken {
        loop {
            // Register interest before checking so a release between the
            // check and the await is not missed.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.held < state.capacity {
                    state.held += 1;
                    state.peak = state.peak.max(state.held);
                    return ConcurrencyToken {
                        limiter: Arc::clone(self),
                    };
                }
            }
            notified.await;
        }
    }

    /// Returns the current capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Returns the number of tokens currently held.
    #[must_use]
    pub fn held(&self) -> usize {
        self.state.lock().held
    }

    /// Returns the highest number of tokens ever held at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.held = state.held.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }
}

fn check_capacity(name: &str, capacity: usize) -> Result<(), ConfigError> {
    let value = i64::try_from(capacity).unwrap_or(i64::MAX);
    if !(RSYNC_THREADS_MIN..=RSYNC_THREADS_MAX).contains(&value) {
        return Err(ConfigError::OutOfRange {
            name: name.to_string(),
            value,
            min: RSYNC_THREADS_MIN,
            max: RSYNC_THREADS_MAX,
        });
    }
    Ok(())
}

/// One held slot; released when dropped.
#[derive(Debug)]
pub struct ConcurrencyToken {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for ConcurrencyToken {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// Runs inner stages in order while holding one limiter slot.
#[derive(Debug)]
pub struct LimitConcurrent {
    limiter: Arc<ConcurrencyLimiter>,
    stages: Vec<Arc<dyn Stage>>,
}

impl LimitConcurrent {
    /// Wraps `stages` behind `limiter`.
    #[must_use]
    pub fn new(limiter: Arc<ConcurrencyLimiter>, stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { limiter, stages }
    }

    /// Returns the wrapped stages.
    #[must_use]
    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }
}

#[async_trait]
impl Stage for LimitConcurrent {
    fn name(&self) -> &str {
        "LimitConcurrent"
    }

    fn kind(&self) -> StageKind {
        StageKind::Limit
    }

    fn fingerprint(&self) -> String {
        self.stages
            .iter()
            .map(|s| format!("{}:{}[{}]", s.kind(), s.name(), s.fingerprint()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        let _token = self.limiter.acquire().await;
        tracing::debug!(item = %item.name(), limiter = %self.limiter.name(), "Acquired slot");

        let mut output = StageOutput::ok();
        for stage in &self.stages {
            let inner = stage.execute(item).await?;
            output = output.with_metadata(stage.name(), serde_json::json!(inner.status.to_string()));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::FnStage;
    use crate::testing::test_item;
    use std::time::Duration;

    #[derive(Debug)]
    struct Sleepy {
        limiter: Arc<ConcurrencyLimiter>,
        fail: bool,
    }

    #[async_trait]
    impl Stage for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn execute(&self, _item: &mut Item) -> Result<StageOutput, PipelineError> {
            assert!(self.limiter.held() <= self.limiter.capacity());
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail {
                return Err(PipelineError::Coordinator("upload refused".into()));
            }
            Ok(StageOutput::ok())
        }
    }

    async fn stress(capacity: usize, fail: bool) -> Arc<ConcurrencyLimiter> {
        let limiter = ConcurrencyLimiter::new("upload", capacity).unwrap();
        let stage = Arc::new(LimitConcurrent::new(
            Arc::clone(&limiter),
            vec![Arc::new(Sleepy {
                limiter: Arc::clone(&limiter),
                fail,
            })],
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..24 {
            let stage = Arc::clone(&stage);
            tasks.spawn(async move {
                let mut item = test_item("project:foo", "/tmp");
                stage.execute(&mut item).await.is_ok()
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap(), !fail);
        }
        limiter
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_capacity() {
        for capacity in 1..=4 {
            let limiter = stress(capacity, false).await;
            assert!(limiter.peak() <= capacity);
            assert!(limiter.peak() >= 1);
            assert_eq!(limiter.held(), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tokens_released_on_failure() {
        for capacity in 1..=4 {
            let limiter = stress(capacity, true).await;
            assert!(limiter.peak() <= capacity);
            assert_eq!(limiter.held(), 0);
        }
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(ConcurrencyLimiter::new("upload", 0).is_err());
        assert!(ConcurrencyLimiter::new("upload", 5).is_err());
        let limiter = ConcurrencyLimiter::new("upload", 1).unwrap();
        assert!(limiter.set_capacity(4).is_ok());
        assert!(limiter.set_capacity(9).is_err());
        assert_eq!(limiter.capacity(), 4);
    }

    #[test]
    fn test_reload_capacity_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let write = |value: i64| {
            std::fs::write(
                &path,
                format!(
                    r#"{{"rsync_threads": {{"name": "shared:rsync_threads", "title": "", "description": "",
                        "min": 1, "max": 4, "default": 1, "value": {value}}}}}"#
                ),
            )
            .unwrap();
        };
        let limiter = ConcurrencyLimiter::new("shared:rsync_threads", 1).unwrap();

        write(3);
        assert_eq!(limiter.reload_capacity(&path).unwrap(), 3);
        assert_eq!(limiter.capacity(), 3);

        write(7);
        assert!(limiter.reload_capacity(&path).is_err());
        assert_eq!(limiter.capacity(), 3);
    }

    #[tokio::test]
    async fn test_raising_capacity_wakes_waiters() {
        let limiter = ConcurrencyLimiter::new("upload", 1).unwrap();
        let first = limiter.acquire().await;

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _token = limiter.acquire().await;
                limiter.held()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        limiter.set_capacity(2).unwrap();
        assert_eq!(waiter.await.unwrap(), 2);
        drop(first);
        assert_eq!(limiter.held(), 0);
    }

    #[tokio::test]
    async fn test_inner_stages_run_in_order() {
        let limiter = ConcurrencyLimiter::new("upload", 1).unwrap();
        let push = |tag: &'static str| -> Arc<dyn Stage> {
            Arc::new(FnStage::new(tag, move |item: &mut Item| {
                item.log_output(tag);
                Ok(StageOutput::ok())
            }))
        };
        let stage = LimitConcurrent::new(limiter, vec![push("upload"), push("done")]);
        let mut item = test_item("project:foo", "/tmp");

        stage.execute(&mut item).await.unwrap();
        assert_eq!(item.log_lines(), ["upload".to_string(), "done".to_string()]);
    }
}
