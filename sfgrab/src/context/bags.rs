//! Key/value bag holding an item's mutable state.

use crate::errors::{DataConflictError, MissingKeyError};
use std::collections::HashMap;

/// Well-known keys written by the pipeline stages.
pub mod keys {
    /// The raw item identifier.
    pub const ITEM_NAME: &str = "item_name";
    /// The item type tag.
    pub const ITEM_TYPE: &str = "item_type";
    /// The item value (identifier without the type tag).
    pub const ITEM_VALUE: &str = "item_value";
    /// The filesystem-safe item value.
    pub const ESCAPED_ITEM_NAME: &str = "escaped_item_name";
    /// The shared output root.
    pub const DATA_DIR: &str = "data_dir";
    /// The per-item working directory.
    pub const ITEM_DIR: &str = "item_dir";
    /// Base filename of the WARC artifact (without extension).
    pub const WARC_FILE_BASE: &str = "warc_file_base";
    /// Stats payload prepared for the coordinator.
    pub const STATS: &str = "stats";
}

/// A bag of JSON values keyed by string.
///
/// Values written with [`ItemBag::set`] are write-once; stages that
/// legitimately update a value use [`ItemBag::set_force`].
#[derive(Debug, Clone, Default)]
pub struct ItemBag {
    data: HashMap<String, serde_json::Value>,
}

impl ItemBag {
    /// Creates a new empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a value from the bag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Gets a string value from the bag.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }

    /// Checks if a key exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Sets a value in the bag.
    ///
    /// # Errors
    ///
    /// Returns `DataConflictError` if the key already exists.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Result<(), DataConflictError> {
        let key = key.into();
        if self.data.contains_key(&key) {
            return Err(DataConflictError::new(key));
        }
        self.data.insert(key, value.into());
        Ok(())
    }

    /// Sets a value, allowing overwrites.
    pub fn set_force(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Removes a value, returning it.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    /// Renders a value for string interpolation.
    ///
    /// Strings render verbatim, everything else as compact JSON.
    pub(crate) fn render(&self, item: &str, key: &str) -> Result<String, MissingKeyError> {
        match self.data.get(key) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(serde_json::Value::Null) | None => Err(MissingKeyError::new(item, key)),
            Some(other) => Ok(other.to_string()),
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns all keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_is_write_once() {
        let mut bag = ItemBag::new();
        bag.set("item_dir", "/data/foo").unwrap();

        let err = bag.set("item_dir", "/data/bar").unwrap_err();
        assert_eq!(err.key, "item_dir");
        assert_eq!(bag.get_str("item_dir"), Some("/data/foo"));
    }

    #[test]
    fn test_set_force_overwrites() {
        let mut bag = ItemBag::new();
        bag.set_force("stats", json!({"bytes": 1}));
        bag.set_force("stats", json!({"bytes": 2}));
        assert_eq!(bag.get("stats"), Some(&json!({"bytes": 2})));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn test_render() {
        let mut bag = ItemBag::new();
        bag.set_force("name", "foo");
        bag.set_force("count", 3);

        assert_eq!(bag.render("item", "name").unwrap(), "foo");
        assert_eq!(bag.render("item", "count").unwrap(), "3");
        assert!(bag.render("item", "missing").is_err());
    }

    #[test]
    fn test_keys_sorted() {
        let mut bag = ItemBag::new();
        bag.set_force("b", 1);
        bag.set_force("a", 2);
        assert_eq!(bag.keys(), vec!["a".to_string(), "b".to_string()]);
        assert!(bag.remove("a").is_some());
        assert!(!bag.contains_key("a"));
    }
}
