//! Typed item identifiers.

use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delimiter between the type tag and the value of an identifier.
pub const ITEM_DELIMITER: char = ':';

/// The kinds of items the coordinator may hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    /// A whole project: its pages, REST endpoints and project web.
    Project,
}

impl ItemType {
    /// Returns the tag as it appears in identifiers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Self::Project),
            // Repository mirrors are handed out by the tracker but have no
            // fetch recipe yet.
            "git" => Err("item type 'git' is not implemented".to_string()),
            other => Err(format!("unknown item type '{other}'")),
        }
    }
}

/// An item identifier such as `project:foo`.
///
/// Parsing only checks the shape (`<tag>:<value>`); whether the tag is
/// supported is decided by [`ItemName::item_type`] at the point of use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemName {
    raw: String,
    split: usize,
}

impl ItemName {
    /// Parses an identifier.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidItem` when the identifier has no
    /// delimiter, an empty tag, an empty value, or a value that escapes to
    /// `.` or `..` and so cannot name a working directory.
    pub fn parse(raw: impl Into<String>) -> Result<Self, PipelineError> {
        let raw = raw.into();
        let Some(split) = raw.find(ITEM_DELIMITER) else {
            return Err(PipelineError::invalid_item(&raw, "missing type delimiter ':'"));
        };
        if split == 0 {
            return Err(PipelineError::invalid_item(&raw, "empty type tag"));
        }
        if split + 1 == raw.len() {
            return Err(PipelineError::invalid_item(&raw, "empty value"));
        }
        if matches!(escape_path_component(&raw[split + 1..]).as_str(), "." | "..") {
            return Err(PipelineError::invalid_item(&raw, "value is a relative path component"));
        }
        Ok(Self { raw, split })
    }

    /// Returns the full identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the raw type tag.
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.raw[..self.split]
    }

    /// Returns the value after the type tag.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    /// Resolves the type tag.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::UnsupportedItemType` for any tag other than
    /// the supported ones.
    pub fn item_type(&self) -> Result<ItemType, PipelineError> {
        self.type_tag()
            .parse()
            .map_err(|_| PipelineError::UnsupportedItemType {
                item: self.raw.clone(),
                item_type: self.type_tag().to_string(),
            })
    }

    /// Returns the value with path-unsafe characters replaced by `_`.
    #[must_use]
    pub fn escaped(&self) -> String {
        escape_path_component(self.value())
    }
}

impl fmt::Display for ItemName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for ItemName {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ItemName> for String {
    fn from(name: ItemName) -> Self {
        name.raw
    }
}

/// Replaces `:`, `/` and `~` with `_`.
#[must_use]
pub fn escape_path_component(value: &str) -> String {
    value.replace([':', '/', '~'], "_")
}
