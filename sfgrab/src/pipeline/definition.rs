//! The ordered list of stages every item goes through.

use crate::config::PipelineConfig;
use crate::context::ItemTemplate;
use crate::coordinator::Coordinator;
use crate::core::StageKind;
use crate::stages::{
    CheckIp, ConcurrencyLimiter, ExternalProcess, HostResolver, LimitConcurrent, MoveFiles,
    PrepareDirectories, PrepareStatsForTracker, ProcessPolicy, SendDoneToTracker, Stage,
    TemplateArgs, UploadWithTracker, WgetDownload,
};
use crate::utils::sha256_hex;
use std::sync::Arc;

/// A named, versioned, fixed sequence of stages.
///
/// Building a definition has no side effects; it is executed by
/// [`PipelineRunner`](super::PipelineRunner).
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    name: String,
    version: String,
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            stages: Vec::new(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Appends a shared stage.
    #[must_use]
    pub fn with_shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the pipeline version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Returns the stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Stable hash of name, version and each stage's kind, name and
    /// fingerprint.
    ///
    /// Reported with every finished item so results can be traced back to
    /// the pipeline that produced them. Fetch arguments, exit-code policies
    /// and file layouts all change the hash; machine-specific tool paths
    /// and the data dir do not.
    #[must_use]
    pub fn definition_hash(&self) -> String {
        let mut layout = format!("{}\n{}\n", self.name, self.version);
        for stage in &self.stages {
            layout.push_str(&format!("{}:{}:{}\n", stage.kind(), stage.name(), stage.fingerprint()));
        }
        sha256_hex(layout)
    }
}

/// Builds the standard fetch-and-upload pipeline.
///
/// ```text
/// CheckIP -> PrepareDirectories -> WgetDownload -> PrepareStatsForTracker
///   -> MoveFiles -> archive -> LimitConcurrent(UploadWithTracker) -> SendDoneToTracker
/// ```
#[must_use]
pub fn default_pipeline(
    config: &Arc<PipelineConfig>,
    coordinator: &Arc<dyn Coordinator>,
    limiter: &Arc<ConcurrencyLimiter>,
    resolver: Arc<dyn HostResolver>,
) -> PipelineDefinition {
    let archive = ExternalProcess::new(
        "archive",
        TemplateArgs::new([
            config.tar_executable.to_string_lossy().into_owned(),
            "-czf".to_string(),
            "{data_dir}/{escaped_item_name}.tar.gz".to_string(),
            "-C".to_string(),
            "{data_dir}".to_string(),
            "{warc_file_base}.warc.gz".to_string(),
        ]),
    )
    .with_kind(StageKind::Finalize);

    let upload = UploadWithTracker::new(
        Arc::clone(coordinator),
        config.rsync_executable.clone(),
        vec![
            ItemTemplate::new("{data_dir}/{warc_file_base}.warc.gz"),
            ItemTemplate::new("{data_dir}/{escaped_item_name}.tar.gz"),
        ],
        config.coordinator_retry.clone(),
        ProcessPolicy {
            max_tries: config.wget_max_tries,
            accept_on_exit_code: vec![0],
            retry_delay: config.retry_delay(),
        },
    );

    PipelineDefinition::new(config.project_name.clone(), config.version.clone())
        .with_stage(CheckIp::with_resolver(
            config.check_ip_hosts.clone(),
            config.check_ip_interval,
            resolver,
        ))
        .with_stage(PrepareDirectories::new(config.warc_prefix()))
        .with_stage(WgetDownload::new(Arc::clone(config)))
        .with_stage(PrepareStatsForTracker::for_warc())
        .with_stage(MoveFiles::new())
        .with_stage(archive)
        .with_stage(LimitConcurrent::new(
            Arc::clone(limiter),
            vec![Arc::new(upload)],
        ))
        .with_stage(SendDoneToTracker::new(
            Arc::clone(coordinator),
            config.coordinator_retry.clone(),
        ))
}
