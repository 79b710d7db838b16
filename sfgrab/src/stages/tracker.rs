//! Stages that report results to the coordinator.

use super::{ProcessPolicy, Stage};
use crate::context::{keys, Item, ItemTemplate};
use crate::coordinator::Coordinator;
use crate::core::{StageKind, StageOutput};
use crate::errors::PipelineError;
use crate::pipeline::{with_retry, RetryConfig};
use crate::stages::Invocation;
use crate::utils::hash_file;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Version reported in stats as the worker implementation version.
pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Computes sizes and digests of the produced files.
#[derive(Debug, Clone)]
pub struct PrepareStatsForTracker {
    file_groups: Vec<(String, Vec<ItemTemplate>)>,
}

impl PrepareStatsForTracker {
    /// Creates the stage from named groups of file templates.
    #[must_use]
    pub fn new(file_groups: Vec<(String, Vec<ItemTemplate>)>) -> Self {
        Self { file_groups }
    }

    /// The single `data` group holding the item's compressed WARC.
    #[must_use]
    pub fn for_warc() -> Self {
        Self::new(vec![(
            "data".to_string(),
            vec![ItemTemplate::new("{item_dir}/{warc_file_base}.warc.gz")],
        )])
    }
}

#[async_trait]
impl Stage for PrepareStatsForTracker {
    fn name(&self) -> &str {
        "PrepareStatsForTracker"
    }

    fn kind(&self) -> StageKind {
        StageKind::Report
    }

    fn fingerprint(&self) -> String {
        self.file_groups
            .iter()
            .map(|(group, files)| {
                let files: Vec<&str> = files.iter().map(ItemTemplate::as_str).collect();
                format!("{group}=[{}]", files.join(" "))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        let mut bytes = Map::new();
        let mut files = Map::new();

        for (group, templates) in &self.file_groups {
            let mut total = 0u64;
            for template in templates {
                let path = PathBuf::from(template.realize(item)?);
                let digest = hash_file(&path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        PipelineError::MissingArtifact { path: path.clone() }
                    } else {
                        e.into()
                    }
                })?;
                total += digest.size;
                files.insert(path.to_string_lossy().into_owned(), serde_json::to_value(&digest)?);
            }
            bytes.insert(group.clone(), json!(total));
        }

        let provenance = item.provenance();
        let stats = json!({
            "item": item.name().as_str(),
            "downloader": provenance.downloader,
            "version": provenance.version,
            "bytes": bytes,
            "files": files,
            "id": {
                "pipeline_hash": provenance.pipeline_hash,
                "worker_version": WORKER_VERSION,
            },
        });
        item.data.set(keys::STATS, stats)?;

        Ok(StageOutput::ok())
    }
}

/// Pushes finished files to the target the coordinator hands out.
#[derive(Debug)]
pub struct UploadWithTracker {
    coordinator: Arc<dyn Coordinator>,
    rsync_executable: PathBuf,
    files: Vec<ItemTemplate>,
    retry: RetryConfig,
    policy: ProcessPolicy,
}

impl UploadWithTracker {
    /// Creates the upload stage. `files` must resolve under the data dir.
    #[must_use]
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        rsync_executable: impl Into<PathBuf>,
        files: Vec<ItemTemplate>,
        retry: RetryConfig,
        policy: ProcessPolicy,
    ) -> Self {
        Self {
            coordinator,
            rsync_executable: rsync_executable.into(),
            files,
            retry,
            policy,
        }
    }

    fn relative_files(&self, item: &Item, data_dir: &Path) -> Result<Vec<String>, PipelineError> {
        self.files
            .iter()
            .map(|template| {
                let path = PathBuf::from(template.realize(item)?);
                if !path.is_file() {
                    return Err(PipelineError::MissingArtifact { path });
                }
                path.strip_prefix(data_dir)
                    .map(|rel| rel.to_string_lossy().into_owned())
                    .map_err(|_| {
                        PipelineError::invalid_item(
                            item.name().as_str(),
                            format!("upload file {} is outside the data dir", path.display()),
                        )
                    })
            })
            .collect()
    }

    /// Builds the rsync command for an already resolved target.
    #[must_use]
    pub fn invocation(&self, data_dir: &Path, target: &str, files: &[String]) -> Invocation {
        let argv = vec![
            self.rsync_executable.to_string_lossy().into_owned(),
            "-av".into(),
            "--no-o".into(),
            "--no-g".into(),
            "--files-from=-".into(),
            "--recursive".into(),
            "--partial".into(),
            "--partial-dir".into(),
            ".rsync-tmp".into(),
            "./".into(),
            target.to_string(),
        ];
        let mut stdin = files.join("\n");
        stdin.push('\n');

        Invocation {
            argv,
            env: Vec::new(),
            cwd: Some(data_dir.to_path_buf()),
            stdin: Some(stdin),
        }
    }
}

#[async_trait]
impl Stage for UploadWithTracker {
    fn name(&self) -> &str {
        "UploadWithTracker"
    }

    fn kind(&self) -> StageKind {
        StageKind::Transfer
    }

    fn fingerprint(&self) -> String {
        let files: Vec<&str> = self.files.iter().map(ItemTemplate::as_str).collect();
        format!("files=[{}] {}", files.join(" "), self.policy.describe())
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        let data_dir = item.data_dir()?;
        let files = self.relative_files(item, &data_dir)?;

        let coordinator = &*self.coordinator;
        let name = item.name().to_string();
        let provenance = item.provenance().clone();
        let (name, downloader, version) = (
            name.as_str(),
            provenance.downloader.as_str(),
            provenance.version.as_str(),
        );
        let target = with_retry(&self.retry, "upload_target", PipelineError::is_retryable, move || {
            coordinator.upload_target(name, downloader, version)
        })
        .await?;

        item.log_output(format!("Uploading with rsync to {target}"));
        let invocation = self.invocation(&data_dir, &target, &files);
        let outcome = self.policy.run(self.name(), item, &invocation).await?;

        Ok(StageOutput::ok()
            .with_metadata("target", json!(target))
            .with_metadata("files", json!(files))
            .with_metadata("attempts", json!(outcome.attempts)))
    }
}

/// Sends the prepared stats and marks the item done.
#[derive(Debug)]
pub struct SendDoneToTracker {
    coordinator: Arc<dyn Coordinator>,
    retry: RetryConfig,
}

impl SendDoneToTracker {
    /// Creates the stage.
    #[must_use]
    pub fn new(coordinator: Arc<dyn Coordinator>, retry: RetryConfig) -> Self {
        Self { coordinator, retry }
    }
}

#[async_trait]
impl Stage for SendDoneToTracker {
    fn name(&self) -> &str {
        "SendDoneToTracker"
    }

    fn kind(&self) -> StageKind {
        StageKind::Report
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        let stats: Value = item
            .data
            .get(keys::STATS)
            .cloned()
            .ok_or_else(|| crate::errors::MissingKeyError::new(item.name().as_str(), keys::STATS))?;

        let coordinator = &*self.coordinator;
        let name = item.name().to_string();
        let (name, stats) = (name.as_str(), &stats);
        with_retry(&self.retry, "send_done", PipelineError::is_retryable, move || {
            coordinator.send_done(name, stats)
        })
        .await?;

        item.log_output("Tracker confirmed item.");
        Ok(StageOutput::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MockCoordinator;
    use crate::pipeline::JitterStrategy;
    use crate::testing::{test_item, InMemoryCoordinator};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    fn staged(root: &Path) -> Item {
        let mut item = test_item("project:foo", root);
        let item_dir = root.join("foo");
        std::fs::create_dir_all(&item_dir).unwrap();
        std::fs::write(item_dir.join("sf-foo-20150614-120000.warc.gz"), b"0123456789").unwrap();
        item.data
            .set(keys::ITEM_DIR, item_dir.to_string_lossy().into_owned())
            .unwrap();
        item.data
            .set_force(keys::WARC_FILE_BASE, "sf-foo-20150614-120000");
        item.data.set_force(keys::ESCAPED_ITEM_NAME, "foo");
        item
    }

    #[tokio::test]
    async fn test_stats_sum_group_sizes() {
        let root = tempfile::tempdir().unwrap();
        let mut item = staged(root.path());

        PrepareStatsForTracker::for_warc()
            .execute(&mut item)
            .await
            .unwrap();

        let stats = item.data.get(keys::STATS).unwrap();
        assert_eq!(stats["item"], json!("project:foo"));
        assert_eq!(stats["bytes"]["data"], json!(10));
        assert_eq!(stats["id"]["worker_version"], json!(WORKER_VERSION));
        assert_eq!(stats["files"].as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_missing_file() {
        let root = tempfile::tempdir().unwrap();
        let mut item = staged(root.path());
        item.data.set_force(keys::WARC_FILE_BASE, "nothing-here");

        let err = PrepareStatsForTracker::for_warc()
            .execute(&mut item)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingArtifact { .. }));
    }

    #[test]
    fn test_rsync_invocation_shape() {
        let stage = UploadWithTracker::new(
            Arc::new(InMemoryCoordinator::new()),
            "rsync",
            Vec::new(),
            fast_retry(),
            ProcessPolicy::default(),
        );
        let inv = stage.invocation(
            Path::new("/data"),
            "rsync://host/module/",
            &["a.warc.gz".to_string(), "foo.tar.gz".to_string()],
        );

        assert_eq!(
            inv.argv,
            vec![
                "rsync", "-av", "--no-o", "--no-g", "--files-from=-", "--recursive",
                "--partial", "--partial-dir", ".rsync-tmp", "./", "rsync://host/module/",
            ]
        );
        assert_eq!(inv.stdin.as_deref(), Some("a.warc.gz\nfoo.tar.gz\n"));
        assert_eq!(inv.cwd.as_deref(), Some(Path::new("/data")));
    }

    #[tokio::test]
    async fn test_upload_rejects_missing_files_before_asking_tracker() {
        let root = tempfile::tempdir().unwrap();
        let mut item = staged(root.path());
        let mut mock = MockCoordinator::new();
        mock.expect_upload_target().never();

        let stage = UploadWithTracker::new(
            Arc::new(mock),
            "true",
            vec![ItemTemplate::new("{data_dir}/{escaped_item_name}.tar.gz")],
            fast_retry(),
            ProcessPolicy::default(),
        );
        let err = stage.execute(&mut item).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingArtifact { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_upload_retries_target_request() {
        let root = tempfile::tempdir().unwrap();
        let mut item = staged(root.path());
        std::fs::write(root.path().join("foo.tar.gz"), b"tar").unwrap();

        let mut mock = MockCoordinator::new();
        let mut calls = 0;
        mock.expect_upload_target().times(2).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Err(PipelineError::Coordinator("busy".into()))
            } else {
                Ok("rsync://host/module/".to_string())
            }
        });

        let stage = UploadWithTracker::new(
            Arc::new(mock),
            "true",
            vec![ItemTemplate::new("{data_dir}/{escaped_item_name}.tar.gz")],
            fast_retry(),
            ProcessPolicy {
                retry_delay: Duration::ZERO,
                ..ProcessPolicy::default()
            },
        );
        let output = stage.execute(&mut item).await.unwrap();
        assert_eq!(output.get_metadata("files"), Some(&json!(["foo.tar.gz"])));
    }

    #[tokio::test]
    async fn test_send_done_forwards_stats() {
        let root = tempfile::tempdir().unwrap();
        let mut item = staged(root.path());
        item.data.set(keys::STATS, json!({"bytes": {"data": 10}})).unwrap();

        let coordinator = Arc::new(InMemoryCoordinator::new());
        SendDoneToTracker::new(coordinator.clone(), fast_retry())
            .execute(&mut item)
            .await
            .unwrap();

        let done = coordinator.done();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, "project:foo");
        assert_eq!(done[0].1["bytes"]["data"], json!(10));
    }

    #[tokio::test]
    async fn test_send_done_requires_stats() {
        let root = tempfile::tempdir().unwrap();
        let mut item = staged(root.path());
        let err = SendDoneToTracker::new(Arc::new(InMemoryCoordinator::new()), fast_retry())
            .execute(&mut item)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingKey(_)));
    }
}
