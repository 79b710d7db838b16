//! Post-fetch artifact checks and the move into the shared output root.

use super::Stage;
use crate::context::{keys, Item};
use crate::core::{StageKind, StageOutput};
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Checks that `<item_dir>/<base>.warc.gz` exists and is not empty.
///
/// # Errors
///
/// An uncompressed `<base>.warc` means the fetcher was built without
/// compression support, which no retry can fix: that is an environment
/// error. A missing or empty compressed file is `MissingArtifact`.
pub async fn verify_compressed_artifact(item_dir: &Path, base: &str) -> Result<PathBuf, PipelineError> {
    let uncompressed = item_dir.join(format!("{base}.warc"));
    if tokio::fs::try_exists(&uncompressed).await? {
        return Err(PipelineError::Environment(
            "Please compile wget with zlib support!".to_string(),
        ));
    }

    let compressed = item_dir.join(format!("{base}.warc.gz"));
    match tokio::fs::metadata(&compressed).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(compressed),
        Ok(_) => Err(PipelineError::MissingArtifact { path: compressed }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PipelineError::MissingArtifact { path: compressed })
        }
        Err(e) => Err(e.into()),
    }
}

/// Removes what an abandoned item left behind: its working directory and,
/// once the artifact is named, the WARC and archive in the data dir.
///
/// Missing files are ignored. Returns the paths that were removed.
///
/// # Errors
///
/// Returns the first filesystem error other than `NotFound`.
pub async fn discard_item_artifacts(item: &Item) -> Result<Vec<PathBuf>, PipelineError> {
    let mut removed = Vec::new();
    let Ok(data_dir) = item.data_dir() else {
        return Ok(removed);
    };

    if let Ok(item_dir) = item.item_dir() {
        if item_dir.parent() == Some(data_dir.as_path()) && remove_if_present(&item_dir, true).await? {
            removed.push(item_dir);
        }
    }

    if let Some(base) = item.data.get_str(keys::WARC_FILE_BASE) {
        let mut files = vec![data_dir.join(format!("{base}.warc.gz"))];
        if let Some(escaped) = item.data.get_str(keys::ESCAPED_ITEM_NAME) {
            files.push(data_dir.join(format!("{escaped}.tar.gz")));
        }
        for file in files {
            if remove_if_present(&file, false).await? {
                removed.push(file);
            }
        }
    }
    Ok(removed)
}

async fn remove_if_present(path: &Path, dir: bool) -> Result<bool, PipelineError> {
    let result = if dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Moves the finished WARC to the data dir and removes the item dir.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveFiles;

impl MoveFiles {
    /// Creates the stage.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for MoveFiles {
    fn name(&self) -> &str {
        "MoveFiles"
    }

    fn kind(&self) -> StageKind {
        StageKind::Finalize
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        let item_dir = item.item_dir()?;
        let data_dir = item.data_dir()?;
        let base = item.require_str(keys::WARC_FILE_BASE)?.to_string();

        let source = verify_compressed_artifact(&item_dir, &base).await?;
        let target = data_dir.join(format!("{base}.warc.gz"));
        tokio::fs::rename(&source, &target).await?;
        tokio::fs::remove_dir_all(&item_dir).await?;

        tracing::debug!(item = %item.name(), target = %target.display(), "Moved WARC");
        Ok(StageOutput::ok().with_metadata("warc", serde_json::json!(target.to_string_lossy())))
    }
}
