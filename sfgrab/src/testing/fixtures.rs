//! Fixtures: items, resolvers and an in-memory coordinator.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::context::{Item, ItemName, Provenance};
use crate::coordinator::Coordinator;
use crate::errors::PipelineError;
use crate::stages::HostResolver;

/// Builds an item as the worker would after claiming `raw`.
///
/// # Panics
///
/// Panics if `raw` has no type delimiter.
#[must_use]
pub fn test_item(raw: &str, data_dir: impl AsRef<Path>) -> Item {
    let name = ItemName::parse(raw).expect("test item names must contain a delimiter");
    Item::new(name, data_dir, Provenance::new("tester", "20150614.01", "test-hash"))
}

/// A resolver answering from a fixed table.
#[derive(Debug, Default)]
pub struct StaticResolver {
    table: HashMap<String, IpAddr>,
    lookups: AtomicUsize,
}

impl StaticResolver {
    /// Creates an empty resolver; every lookup fails.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an answer.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, addr: IpAddr) -> Self {
        self.table.insert(host.into(), addr);
        self
    }

    /// Returns how many lookups were made.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<IpAddr> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.table.get(host).copied().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("unknown host {host}"))
        })
    }
}

/// A coordinator keeping its queue and reports in memory.
#[derive(Debug)]
pub struct InMemoryCoordinator {
    queue: Mutex<VecDeque<String>>,
    upload_target: String,
    done: Mutex<Vec<(String, serde_json::Value)>>,
    failed: Mutex<Vec<(String, String)>>,
    upload_requests: Mutex<Vec<String>>,
    unreachable: AtomicBool,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            upload_target: "rsync://localhost/upload/".to_string(),
            done: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            upload_requests: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
        }
    }
}

impl InMemoryCoordinator {
    /// Creates a coordinator with no work.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a coordinator that hands out `items` in order.
    #[must_use]
    pub fn with_items(items: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let coordinator = Self::default();
        coordinator
            .queue
            .lock()
            .extend(items.into_iter().map(Into::into));
        coordinator
    }

    /// Sets the upload target returned to every item.
    #[must_use]
    pub fn with_upload_target(mut self, target: impl Into<String>) -> Self {
        self.upload_target = target.into();
        self
    }

    /// Makes every call fail as if the coordinator were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Returns the number of items not yet claimed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns the items reported done with their stats.
    #[must_use]
    pub fn done(&self) -> Vec<(String, serde_json::Value)> {
        self.done.lock().clone()
    }

    /// Returns the items reported failed with their reasons.
    #[must_use]
    pub fn failed(&self) -> Vec<(String, String)> {
        self.failed.lock().clone()
    }

    /// Returns the items that asked for an upload target.
    #[must_use]
    pub fn upload_requests(&self) -> Vec<String> {
        self.upload_requests.lock().clone()
    }

    fn check_reachable(&self) -> Result<(), PipelineError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(PipelineError::Coordinator("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn request_item(
        &self,
        _downloader: &str,
        _version: &str,
    ) -> Result<Option<String>, PipelineError> {
        self.check_reachable()?;
        Ok(self.queue.lock().pop_front())
    }

    async fn upload_target(
        &self,
        item: &str,
        _downloader: &str,
        _version: &str,
    ) -> Result<String, PipelineError> {
        self.check_reachable()?;
        self.upload_requests.lock().push(item.to_string());
        Ok(self.upload_target.clone())
    }

    async fn send_done(&self, item: &str, stats: &serde_json::Value) -> Result<(), PipelineError> {
        self.check_reachable()?;
        self.done.lock().push((item.to_string(), stats.clone()));
        Ok(())
    }

    async fn fail_item(
        &self,
        item: &str,
        _downloader: &str,
        _version: &str,
        reason: &str,
    ) -> Result<(), PipelineError> {
        self.check_reachable()?;
        self.failed.lock().push((item.to_string(), reason.to_string()));
        Ok(())
    }
}
