//! The mutable context owned by one in-flight item.

use super::{keys, ItemBag, ItemName};
use crate::errors::{MissingKeyError, PipelineError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Who processed an item and with which pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// The downloader (operator) nickname reported to the coordinator.
    pub downloader: String,
    /// The pipeline version string burned into artifacts.
    pub version: String,
    /// Stable hash of the pipeline definition.
    pub pipeline_hash: String,
}

impl Provenance {
    /// Creates a new provenance record.
    #[must_use]
    pub fn new(
        downloader: impl Into<String>,
        version: impl Into<String>,
        pipeline_hash: impl Into<String>,
    ) -> Self {
        Self {
            downloader: downloader.into(),
            version: version.into(),
            pipeline_hash: pipeline_hash.into(),
        }
    }
}

/// One unit of work and everything the stages learn about it.
///
/// An `Item` is owned by exactly one pipeline run; stages receive it as
/// `&mut Item` in sequence.
#[derive(Debug)]
pub struct Item {
    name: ItemName,
    attempt_id: Uuid,
    provenance: Provenance,
    /// Derived paths, filenames, flags and stats.
    pub data: ItemBag,
    log: Vec<String>,
}

impl Item {
    /// Creates the context for a freshly claimed item.
    #[must_use]
    pub fn new(name: ItemName, data_dir: impl AsRef<Path>, provenance: Provenance) -> Self {
        let mut data = ItemBag::new();
        data.set_force(keys::ITEM_NAME, name.as_str());
        data.set_force(
            keys::DATA_DIR,
            data_dir.as_ref().to_string_lossy().into_owned(),
        );

        Self {
            name,
            attempt_id: Uuid::new_v4(),
            provenance,
            data,
            log: Vec::new(),
        }
    }

    /// Returns the item identifier.
    #[must_use]
    pub fn name(&self) -> &ItemName {
        &self.name
    }

    /// Returns the id correlating log lines of this attempt.
    #[must_use]
    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    /// Returns the provenance record.
    #[must_use]
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Reads a required string value.
    ///
    /// # Errors
    ///
    /// Returns `MissingKeyError` if the key is absent or not a string.
    pub fn require_str(&self, key: &str) -> Result<&str, MissingKeyError> {
        self.data
            .get_str(key)
            .ok_or_else(|| MissingKeyError::new(self.name.as_str(), key))
    }

    /// Reads a required path value.
    ///
    /// # Errors
    ///
    /// Returns `MissingKeyError` if the key is absent.
    pub fn require_path(&self, key: &str) -> Result<PathBuf, MissingKeyError> {
        self.require_str(key).map(PathBuf::from)
    }

    /// Returns the shared output root.
    ///
    /// # Errors
    ///
    /// Returns an error if the item was built without a data dir.
    pub fn data_dir(&self) -> Result<PathBuf, PipelineError> {
        Ok(self.require_path(keys::DATA_DIR)?)
    }

    /// Returns the per-item working directory set by staging.
    ///
    /// # Errors
    ///
    /// Returns an error if staging has not run yet.
    pub fn item_dir(&self) -> Result<PathBuf, PipelineError> {
        Ok(self.require_path(keys::ITEM_DIR)?)
    }

    /// Writes a human-readable line to the log and the item's own log.
    pub fn log_output(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(item = %self.name, attempt = %self.attempt_id, "{}", message);
        self.log.push(message);
    }

    /// Returns the lines written through [`Item::log_output`].
    #[must_use]
    pub fn log_lines(&self) -> &[String] {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> Item {
        Item::new(
            ItemName::parse("project:foo").unwrap(),
            "/data",
            Provenance::new("tester", "20150614.01", "abc"),
        )
    }

    #[test]
    fn test_new_item_seeds_bag() {
        let item = item();
        assert_eq!(item.data.get_str(keys::ITEM_NAME), Some("project:foo"));
        assert_eq!(item.data_dir().unwrap(), PathBuf::from("/data"));
        assert_eq!(item.provenance().downloader, "tester");
    }

    #[test]
    fn test_item_dir_requires_staging() {
        let item = item();
        assert!(matches!(item.item_dir(), Err(PipelineError::MissingKey(_))));
    }

    #[test]
    fn test_log_output_is_recorded() {
        let mut item = item();
        item.log_output("Checking IP address.");
        assert_eq!(item.log_lines(), ["Checking IP address.".to_string()]);
    }

    #[test]
    fn test_attempt_ids_differ() {
        assert_ne!(item().attempt_id(), item().attempt_id());
    }
}
