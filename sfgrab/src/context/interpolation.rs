//! Templates realized against an item at the point of use.

use super::Item;
use crate::errors::PipelineError;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern"))
}

/// A string with `{key}` placeholders filled from the item bag.
///
/// ```
/// use sfgrab::context::{Item, ItemName, ItemTemplate, Provenance};
///
/// let item = Item::new(
///     ItemName::parse("project:foo").unwrap(),
///     "/data",
///     Provenance::new("me", "1", "hash"),
/// );
/// let template = ItemTemplate::new("{data_dir}/{item_name}");
/// assert_eq!(template.realize(&item).unwrap(), "/data/project:foo");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemTemplate {
    template: String,
}

impl ItemTemplate {
    /// Creates a template.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Returns the unresolved template text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Returns the keys referenced by the template, in order of appearance.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        placeholder_pattern()
            .captures_iter(&self.template)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    }

    /// Resolves every placeholder against the item.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::MissingKey` if a placeholder names a key the
    /// item does not have.
    pub fn realize(&self, item: &Item) -> Result<String, PipelineError> {
        let mut out = String::with_capacity(self.template.len());
        let mut last = 0;

        for caps in placeholder_pattern().captures_iter(&self.template) {
            let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&self.template[last..whole.start()]);
            out.push_str(&item.data.render(item.name().as_str(), key.as_str())?);
            last = whole.end();
        }
        out.push_str(&self.template[last..]);

        Ok(out)
    }
}

impl fmt::Display for ItemTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

impl From<&str> for ItemTemplate {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
