//! Worker configuration.
//!
//! All settings the stages need are gathered in one immutable
//! [`PipelineConfig`] that is shared as `Arc<PipelineConfig>`. Values come
//! from serde defaults, an optional JSON file, and command-line overrides.

use crate::errors::{ConfigError, PipelineError};
use crate::pipeline::RetryConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// An integer setting with a documented range, exposed for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberConfigValue {
    /// Setting name, e.g. `shared:rsync_threads`.
    pub name: String,
    /// Short human title.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Lower bound (inclusive).
    pub min: i64,
    /// Upper bound (inclusive).
    pub max: i64,
    /// Default value.
    pub default: i64,
    /// Current value, `None` meaning the default.
    #[serde(default)]
    pub value: Option<i64>,
}

impl NumberConfigValue {
    /// Creates a bounded setting holding its default.
    #[must_use]
    pub fn new(name: impl Into<String>, min: i64, max: i64, default: i64) -> Self {
        Self {
            name: name.into(),
            title: String::new(),
            description: String::new(),
            min,
            max,
            default,
            value: None,
        }
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Checks that a candidate value is within range.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::OutOfRange` otherwise.
    pub fn check(&self, value: i64) -> Result<i64, ConfigError> {
        if value < self.min || value > self.max {
            return Err(ConfigError::OutOfRange {
                name: self.name.clone(),
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(value)
    }

    /// Sets the current value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::OutOfRange` if the value is outside the range.
    pub fn set(&mut self, value: i64) -> Result<(), ConfigError> {
        self.value = Some(self.check(value)?);
        Ok(())
    }

    /// Returns the current value, falling back to the default.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.unwrap_or(self.default)
    }
}

/// Bounded number of concurrent uploads.
pub const RSYNC_THREADS_MIN: i64 = 1;
/// Upper bound of concurrent uploads.
pub const RSYNC_THREADS_MAX: i64 = 4;

fn default_rsync_threads() -> NumberConfigValue {
    NumberConfigValue::new("shared:rsync_threads", RSYNC_THREADS_MIN, RSYNC_THREADS_MAX, 1)
        .with_title("Rsync threads")
        .with_description("The maximum number of concurrent uploads.")
}

fn default_project_name() -> String {
    "sourceforge".to_string()
}

fn default_version() -> String {
    "20150614.01".to_string()
}

fn default_user_agent() -> String {
    "ArchiveTeam".to_string()
}

fn default_tracker_host() -> String {
    "tracker.nerds.io".to_string()
}

fn default_tracker_id() -> String {
    "sourceforge-rsync".to_string()
}

fn default_downloader() -> String {
    "anonymous".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_wget_executable() -> PathBuf {
    PathBuf::from("wget-lua")
}

fn default_rsync_executable() -> PathBuf {
    PathBuf::from("rsync")
}

fn default_tar_executable() -> PathBuf {
    PathBuf::from("tar")
}

fn default_wget_domains() -> Vec<String> {
    vec!["sourceforge.net".to_string()]
}

fn default_check_ip_hosts() -> Vec<String> {
    [
        "twitter.com",
        "facebook.com",
        "youtube.com",
        "microsoft.com",
        "icanhas.cheezburger.com",
        "archiveteam.org",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_check_ip_interval() -> usize {
    10
}

fn default_max_tries() -> usize {
    2
}

fn default_retry_delay_secs() -> f64 {
    30.0
}

fn default_concurrent_items() -> usize {
    2
}

fn default_idle_delay_secs() -> f64 {
    30.0
}

fn default_coordinator_retry() -> RetryConfig {
    RetryConfig::default()
}

/// Immutable settings shared by the worker and its stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Project name; prefixes WARC header names.
    #[serde(default = "default_project_name")]
    pub project_name: String,
    /// Pipeline version; burned into artifacts and reported to the tracker.
    #[serde(default = "default_version")]
    pub version: String,
    /// User agent passed to the fetcher.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Tracker host name.
    #[serde(default = "default_tracker_host")]
    pub tracker_host: String,
    /// Tracker project id.
    #[serde(default = "default_tracker_id")]
    pub tracker_id: String,
    /// Downloader nickname reported to the tracker.
    #[serde(default = "default_downloader")]
    pub downloader: String,
    /// Working root and shared output root.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Prefix of WARC filenames; defaults to the project name.
    #[serde(default)]
    pub warc_prefix: Option<String>,
    /// Fetcher executable.
    #[serde(default = "default_wget_executable")]
    pub wget_executable: PathBuf,
    /// Optional lua hook script for the fetcher.
    #[serde(default)]
    pub lua_script: Option<PathBuf>,
    /// Domains the fetcher may recurse into.
    #[serde(default = "default_wget_domains")]
    pub wget_domains: Vec<String>,
    /// Total fetch attempts before the item is abandoned.
    #[serde(default = "default_max_tries")]
    pub wget_max_tries: usize,
    /// Seconds between external process attempts.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    /// File-sync executable.
    #[serde(default = "default_rsync_executable")]
    pub rsync_executable: PathBuf,
    /// Archive executable.
    #[serde(default = "default_tar_executable")]
    pub tar_executable: PathBuf,
    /// Local address all fetches bind to.
    #[serde(default)]
    pub bind_address: Option<IpAddr>,
    /// Hosts resolved by the environment guard.
    #[serde(default = "default_check_ip_hosts")]
    pub check_ip_hosts: Vec<String>,
    /// Items between two environment checks.
    #[serde(default = "default_check_ip_interval")]
    pub check_ip_interval: usize,
    /// Concurrent upload slots.
    #[serde(default = "default_rsync_threads")]
    pub rsync_threads: NumberConfigValue,
    /// Items processed at the same time.
    #[serde(default = "default_concurrent_items")]
    pub concurrent_items: usize,
    /// Seconds to wait when the tracker has no work.
    #[serde(default = "default_idle_delay_secs")]
    pub idle_delay_secs: f64,
    /// Retry policy for coordinator calls.
    #[serde(default = "default_coordinator_retry")]
    pub coordinator_retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            version: default_version(),
            user_agent: default_user_agent(),
            tracker_host: default_tracker_host(),
            tracker_id: default_tracker_id(),
            downloader: default_downloader(),
            data_dir: default_data_dir(),
            warc_prefix: None,
            wget_executable: default_wget_executable(),
            lua_script: None,
            wget_domains: default_wget_domains(),
            wget_max_tries: default_max_tries(),
            retry_delay_secs: default_retry_delay_secs(),
            rsync_executable: default_rsync_executable(),
            tar_executable: default_tar_executable(),
            bind_address: None,
            check_ip_hosts: default_check_ip_hosts(),
            check_ip_interval: default_check_ip_interval(),
            rsync_threads: default_rsync_threads(),
            concurrent_items: default_concurrent_items(),
            idle_delay_secs: default_idle_delay_secs(),
            coordinator_retry: default_coordinator_retry(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a JSON file; missing fields use defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates ranges and required values.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rsync_threads.check(self.rsync_threads.get())?;
        if self.version.trim().is_empty() {
            return Err(ConfigError::Empty("version".into()));
        }
        if self.downloader.trim().is_empty() {
            return Err(ConfigError::Empty("downloader".into()));
        }
        if self.wget_domains.is_empty() {
            return Err(ConfigError::Empty("wget_domains".into()));
        }
        if self.check_ip_interval == 0 {
            return Err(ConfigError::OutOfRange {
                name: "check_ip_interval".into(),
                value: 0,
                min: 1,
                max: i64::MAX,
            });
        }
        if self.wget_max_tries == 0 {
            return Err(ConfigError::OutOfRange {
                name: "wget_max_tries".into(),
                value: 0,
                min: 1,
                max: i64::MAX,
            });
        }
        if self.concurrent_items == 0 {
            return Err(ConfigError::OutOfRange {
                name: "concurrent_items".into(),
                value: 0,
                min: 1,
                max: i64::MAX,
            });
        }
        Ok(())
    }

    /// Returns the tracker base URL.
    #[must_use]
    pub fn tracker_url(&self) -> String {
        format!("http://{}/{}", self.tracker_host, self.tracker_id)
    }

    /// Returns the WARC filename prefix.
    #[must_use]
    pub fn warc_prefix(&self) -> &str {
        self.warc_prefix.as_deref().unwrap_or(&self.project_name)
    }

    /// Returns the delay between external process attempts.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs.max(0.0))
    }

    /// Returns the delay used when the tracker has no work.
    #[must_use]
    pub fn idle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.idle_delay_secs.max(0.0))
    }

    /// Returns the configured number of upload slots.
    #[must_use]
    pub fn upload_slots(&self) -> usize {
        usize::try_from(self.rsync_threads.get()).unwrap_or(1)
    }

    /// Sets the downloader nickname.
    #[must_use]
    pub fn with_downloader(mut self, downloader: impl Into<String>) -> Self {
        self.downloader = downloader.into();
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Sets the bind address.
    #[must_use]
    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Sets the delay between external process attempts.
    #[must_use]
    pub fn with_retry_delay_secs(mut self, secs: f64) -> Self {
        self.retry_delay_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.tracker_url(), "http://tracker.nerds.io/sourceforge-rsync");
        assert_eq!(config.warc_prefix(), "sourceforge");
        assert_eq!(config.upload_slots(), 1);
        assert_eq!(config.check_ip_hosts.len(), 6);
        assert_eq!(config.check_ip_interval, 10);
        assert_eq!(config.wget_max_tries, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_number_config_value_bounds() {
        let mut threads = default_rsync_threads();
        assert_eq!(threads.get(), 1);
        assert!(threads.set(4).is_ok());
        assert_eq!(threads.get(), 4);
        assert!(threads.set(0).is_err());
        assert!(threads.set(5).is_err());
        assert_eq!(threads.get(), 4);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"downloader": "alice", "wget_domains": ["sourceforge.net", "sf.net"]}"#,
        )
        .unwrap();
        assert_eq!(config.downloader, "alice");
        assert_eq!(config.wget_domains.len(), 2);
        assert_eq!(config.version, "20150614.01");
        assert!(config.bind_address.is_none());
    }

    #[test]
    fn test_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"rsync_threads": {"name": "shared:rsync_threads", "title": "", "description": "",
                "min": 1, "max": 4, "default": 1, "value": 9}}"#,
        )
        .unwrap();

        let err = PipelineConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn test_validate_rejects_empty_domains() {
        let mut config = PipelineConfig::default();
        config.wget_domains.clear();
        assert!(config.validate().is_err());
    }
}
