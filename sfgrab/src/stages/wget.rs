//! The recursive fetch of one item into a WARC file.

use super::{verify_compressed_artifact, ArgsRealizer, ExternalProcess, Stage};
use crate::config::PipelineConfig;
use crate::context::{keys, Item, ItemType};
use crate::core::{StageKind, StageOutput};
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Exit codes the fetcher may end with on a usable crawl.
///
/// 4 is a network failure and 8 a server error response; both are normal on
/// large crawls and the WARC is still kept.
pub const WGET_ACCEPTED_EXIT_CODES: [i32; 3] = [0, 4, 8];

/// Builds the fetcher command line for an item.
#[derive(Debug, Clone)]
pub struct WgetArgs {
    config: Arc<PipelineConfig>,
}

impl WgetArgs {
    /// Creates the builder.
    #[must_use]
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    /// Seed URLs for an item of the given type.
    #[must_use]
    pub fn target_urls(item_type: ItemType, value: &str) -> Vec<String> {
        match item_type {
            ItemType::Project => vec![
                format!("http://sourceforge.net/projects/{value}/"),
                format!("http://sourceforge.net/p/{value}/"),
                format!("http://sourceforge.net/rest/p/{value}/"),
                format!("http://sourceforge.net/rest/p/{value}?doap"),
                format!("http://{value}.sourceforge.net/"),
            ],
        }
    }
}

impl WgetArgs {
    fn build(&self, item_dir: &Path, warc_base: &str, item_name: &str, urls: Vec<String>) -> Vec<String> {
        let config = &self.config;

        let mut args = vec![
            config.wget_executable.to_string_lossy().into_owned(),
            "-U".into(),
            config.user_agent.clone(),
            "-nv".into(),
        ];
        if let Some(ref script) = config.lua_script {
            args.push("--lua-script".into());
            args.push(script.to_string_lossy().into_owned());
        }
        args.extend([
            "-o".into(),
            item_dir.join("wget.log").to_string_lossy().into_owned(),
            "--no-check-certificate".into(),
            "--output-document".into(),
            item_dir.join("wget.tmp").to_string_lossy().into_owned(),
            "--truncate-output".into(),
            "-e".into(),
            "robots=off".into(),
            "--rotate-dns".into(),
            "--recursive".into(),
            "--level=inf".into(),
            "--no-parent".into(),
            "--page-requisites".into(),
            "--timeout".into(),
            "30".into(),
            "--tries".into(),
            "inf".into(),
            "--domains".into(),
            config.wget_domains.join(","),
            "--span-hosts".into(),
            "--waitretry".into(),
            "30".into(),
            "--warc-file".into(),
            item_dir.join(warc_base).to_string_lossy().into_owned(),
            "--warc-header".into(),
            "operator: Archive Team".into(),
            "--warc-header".into(),
            format!("{}-dld-script-version: {}", config.project_name, config.version),
            "--warc-header".into(),
            format!("{}-user: {item_name}", config.project_name),
        ]);
        args.extend(urls);

        if let Some(addr) = config.bind_address {
            args.push("--bind-address".into());
            args.push(addr.to_string());
        }

        args
    }
}

impl ArgsRealizer for WgetArgs {
    fn realize(&self, item: &mut Item) -> Result<Vec<String>, PipelineError> {
        let type_tag = item.name().type_tag().to_string();
        let value = item.name().value().to_string();
        item.data.set_force(keys::ITEM_TYPE, type_tag);
        item.data.set_force(keys::ITEM_VALUE, value.clone());

        let item_type = item.name().item_type()?;
        let item_dir = item.item_dir()?;
        let warc_base = item.require_str(keys::WARC_FILE_BASE)?;

        Ok(self.build(
            &item_dir,
            warc_base,
            item.name().as_str(),
            Self::target_urls(item_type, &value),
        ))
    }

    fn layout(&self) -> String {
        let urls = Self::target_urls(ItemType::Project, "{item_value}");
        self.build(Path::new("{item_dir}"), "{warc_file_base}", "{item_name}", urls)[1..].join(" ")
    }
}

/// Runs the fetcher and checks that it produced a compressed WARC.
#[derive(Debug)]
pub struct WgetDownload {
    process: ExternalProcess,
}

impl WgetDownload {
    /// Creates the download stage from configuration.
    #[must_use]
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        let process = ExternalProcess::new("WgetDownload", WgetArgs::new(Arc::clone(&config)))
            .with_max_tries(config.wget_max_tries)
            .with_accept_on_exit_code(WGET_ACCEPTED_EXIT_CODES)
            .with_retry_delay(config.retry_delay())
            .with_env("item_dir", "{item_dir}")
            .with_env("item_value", "{item_value}")
            .with_env("item_type", "{item_type}");
        Self { process }
    }
}

#[async_trait]
impl Stage for WgetDownload {
    fn name(&self) -> &str {
        self.process.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Transfer
    }

    fn fingerprint(&self) -> String {
        self.process.fingerprint()
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        let output = self.process.execute(item).await?;

        let item_dir = item.item_dir()?;
        let base = item.require_str(keys::WARC_FILE_BASE)?.to_string();
        if let Err(e) = verify_compressed_artifact(&item_dir, &base).await {
            item.log_output(e.to_string());
            tracing::error!(item = %item.name(), error = %e, "Fetch produced no usable WARC");
            return Err(e);
        }

        Ok(output)
    }
}
