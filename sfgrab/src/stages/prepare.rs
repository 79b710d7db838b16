//! Local staging: per-item working directory and derived names.

use super::Stage;
use crate::context::{keys, Item};
use crate::core::{StageKind, StageOutput};
use crate::errors::PipelineError;
use crate::utils::warc_timestamp;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

/// Joins `escaped` onto `data_dir`, refusing anything that is not a single
/// plain path component directly inside it.
pub(crate) fn item_dir_within(data_dir: &Path, escaped: &str) -> Result<PathBuf, PipelineError> {
    let mut components = Path::new(escaped).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    let dir = data_dir.join(escaped);
    if !single || dir.parent() != Some(data_dir) {
        return Err(PipelineError::invalid_item(
            escaped,
            "working directory must sit directly inside the data directory",
        ));
    }
    Ok(dir)
}

/// Creates a fresh working directory for the item and names its artifact.
///
/// Any leftover directory from a crashed attempt on the same identifier is
/// removed first. An empty placeholder `<base>.warc.gz` is created so that
/// existence checks running before the fetch behave predictably.
#[derive(Debug, Clone)]
pub struct PrepareDirectories {
    warc_prefix: String,
}

impl PrepareDirectories {
    /// Creates the stage; `warc_prefix` starts every artifact name.
    #[must_use]
    pub fn new(warc_prefix: impl Into<String>) -> Self {
        Self {
            warc_prefix: warc_prefix.into(),
        }
    }
}

#[async_trait]
impl Stage for PrepareDirectories {
    fn name(&self) -> &str {
        "PrepareDirectories"
    }

    fn kind(&self) -> StageKind {
        StageKind::Prepare
    }

    fn fingerprint(&self) -> String {
        format!("warc_prefix={}", self.warc_prefix)
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        let escaped = item.name().escaped();
        let dirname = item_dir_within(&item.data_dir()?, &escaped)?;

        if tokio::fs::metadata(&dirname)
            .await
            .is_ok_and(|m| m.is_dir())
        {
            tracing::debug!(dir = %dirname.display(), "Removing leftover item directory");
            tokio::fs::remove_dir_all(&dirname).await?;
        }
        tokio::fs::create_dir_all(&dirname).await?;

        let warc_file_base = format!("{}-{}-{}", self.warc_prefix, escaped, warc_timestamp());
        let placeholder = dirname.join(format!("{warc_file_base}.warc.gz"));

        item.data
            .set(keys::ITEM_DIR, dirname.to_string_lossy().into_owned())?;
        item.data.set_force(keys::ESCAPED_ITEM_NAME, escaped);
        item.data.set_force(keys::WARC_FILE_BASE, warc_file_base);

        tokio::fs::File::create(&placeholder).await?;

        Ok(StageOutput::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_item;
    use regex::Regex;

    #[tokio::test]
    async fn test_prepare_creates_directory_and_placeholder() {
        let root = tempfile::tempdir().unwrap();
        let mut item = test_item("project:foo", root.path());

        PrepareDirectories::new("sourceforge")
            .execute(&mut item)
            .await
            .unwrap();

        let item_dir = item.item_dir().unwrap();
        assert_eq!(item_dir, root.path().join("foo"));
        assert!(item_dir.is_dir());

        let base = item.require_str(keys::WARC_FILE_BASE).unwrap();
        let pattern = Regex::new(r"^sourceforge-foo-\d{8}-\d{6}$").unwrap();
        assert!(pattern.is_match(base), "unexpected base {base}");

        let placeholder = item_dir.join(format!("{base}.warc.gz"));
        assert_eq!(std::fs::metadata(placeholder).unwrap().len(), 0);
        assert_eq!(item.data.get_str(keys::ESCAPED_ITEM_NAME), Some("foo"));
    }

    #[tokio::test]
    async fn test_prepare_twice_resets_directory() {
        let root = tempfile::tempdir().unwrap();
        let stage = PrepareDirectories::new("sourceforge");

        let mut first = test_item("project:foo", root.path());
        stage.execute(&mut first).await.unwrap();
        let dir = first.item_dir().unwrap();
        std::fs::write(dir.join("leftover.log"), b"crash").unwrap();
        std::fs::create_dir(dir.join("nested")).unwrap();

        let mut second = test_item("project:foo", root.path());
        stage.execute(&mut second).await.unwrap();

        assert_eq!(second.item_dir().unwrap(), dir);
        let entries: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        // Only the fresh placeholder remains.
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with(".warc.gz"));
    }

    #[tokio::test]
    async fn test_prepare_escapes_unsafe_characters() {
        let root = tempfile::tempdir().unwrap();
        let mut item = test_item("project:~a/b:c", root.path());

        PrepareDirectories::new("sf").execute(&mut item).await.unwrap();

        assert_eq!(item.item_dir().unwrap(), root.path().join("_a_b_c"));
    }

    #[test]
    fn test_item_dir_must_stay_inside_data_dir() {
        let root = Path::new("/srv/data");
        assert_eq!(item_dir_within(root, "foo").unwrap(), root.join("foo"));
        assert_eq!(item_dir_within(root, "...").unwrap(), root.join("..."));
        for bad in ["", ".", "..", "a/b", "/etc"] {
            assert!(
                matches!(item_dir_within(root, bad), Err(PipelineError::InvalidItem { .. })),
                "{bad:?} was accepted"
            );
        }
    }

    #[tokio::test]
    async fn test_prepare_filesystem_error_propagates() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("file");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let mut item = test_item("project:foo", &blocker);

        let err = PrepareDirectories::new("sf")
            .execute(&mut item)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
        assert!(!err.is_retryable());
    }
}
