//! Environment guard: refuses to work behind a DNS-collapsing proxy.

use super::Stage;
use crate::context::Item;
use crate::core::{StageKind, StageOutput};
use crate::errors::PipelineError;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const PROXY_WARNING: &str = "Are you behind a firewall/proxy? That is a big no-no!";

/// Resolves a host name to one address.
#[async_trait]
pub trait HostResolver: Send + Sync + Debug {
    /// Returns the address a plain lookup of `host` would use.
    async fn resolve(&self, host: &str) -> std::io::Result<IpAddr>;
}

/// Resolver backed by the system resolver.
///
/// Prefers the first IPv4 answer, like a classic `gethostbyname`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<IpAddr> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 80))
            .await?
            .map(|a| a.ip())
            .collect();

        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses for {host}"),
                )
            })
    }
}

/// Verifies that well-known hosts resolve to distinct addresses.
///
/// Some intercepting proxies answer every lookup with their own address,
/// which would silently corrupt every fetch. The check runs for the first
/// item and then once every `interval` items.
#[derive(Debug)]
pub struct CheckIp {
    hosts: Vec<String>,
    interval: usize,
    resolver: Arc<dyn HostResolver>,
    processed: AtomicUsize,
}

impl CheckIp {
    /// Creates a guard over `hosts` using the system resolver.
    #[must_use]
    pub fn new(hosts: impl IntoIterator<Item = impl Into<String>>, interval: usize) -> Self {
        Self::with_resolver(hosts, interval, Arc::new(SystemResolver))
    }

    /// Creates a guard with a custom resolver.
    #[must_use]
    pub fn with_resolver(
        hosts: impl IntoIterator<Item = impl Into<String>>,
        interval: usize,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        let hosts: BTreeSet<String> = hosts.into_iter().map(Into::into).collect();
        Self {
            hosts: hosts.into_iter().collect(),
            interval: interval.max(1),
            resolver,
            processed: AtomicUsize::new(0),
        }
    }

    /// Returns the number of items seen so far.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    async fn check(&self, item: &mut Item) -> Result<(), PipelineError> {
        let lookups = self.hosts.iter().map(|host| async move {
            self.resolver.resolve(host).await.map_err(|e| {
                PipelineError::Environment(format!("could not resolve {host}: {e}"))
            })
        });
        let addresses: BTreeSet<IpAddr> = try_join_all(lookups).await?.into_iter().collect();

        if addresses.len() != self.hosts.len() {
            let listed: Vec<String> = addresses.iter().map(ToString::to_string).collect();
            item.log_output(format!("Got IP addresses: {{{}}}", listed.join(", ")));
            item.log_output(PROXY_WARNING);
            tracing::error!(
                expected = self.hosts.len(),
                distinct = addresses.len(),
                addresses = ?listed,
                "DNS lookups collapsed to too few addresses"
            );
            return Err(PipelineError::Environment(format!(
                "{PROXY_WARNING} {} host(s) resolved to only {} distinct address(es): {}",
                self.hosts.len(),
                addresses.len(),
                listed.join(", ")
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Stage for CheckIp {
    fn name(&self) -> &str {
        "CheckIP"
    }

    fn kind(&self) -> StageKind {
        StageKind::Guard
    }

    fn fingerprint(&self) -> String {
        format!("hosts={} interval={}", self.hosts.join(","), self.interval)
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        let seen = self.processed.fetch_add(1, Ordering::SeqCst);
        if seen % self.interval != 0 {
            return Ok(StageOutput::skip("IP check not due"));
        }

        item.log_output("Checking IP address.");
        self.check(item).await?;
        Ok(StageOutput::ok().with_metadata("hosts", serde_json::json!(self.hosts.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_output_skipped, test_item, StaticResolver};
    use std::net::Ipv4Addr;

    fn distinct_resolver() -> Arc<StaticResolver> {
        Arc::new(
            StaticResolver::new()
                .with_host("a.example", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
                .with_host("b.example", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
                .with_host("c.example", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))),
        )
    }

    #[tokio::test]
    async fn test_distinct_addresses_pass() {
        let resolver = distinct_resolver();
        let guard = CheckIp::with_resolver(["a.example", "b.example", "c.example"], 10, resolver);
        let mut item = test_item("project:foo", "/tmp");

        let output = guard.execute(&mut item).await.unwrap();
        assert!(output.is_ok());
        assert_eq!(item.log_lines(), ["Checking IP address.".to_string()]);
    }

    #[tokio::test]
    async fn test_collapsed_addresses_fail() {
        let proxy = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let resolver = Arc::new(
            StaticResolver::new()
                .with_host("a.example", proxy)
                .with_host("b.example", proxy)
                .with_host("c.example", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))),
        );
        let guard = CheckIp::with_resolver(["a.example", "b.example", "c.example"], 10, resolver);
        let mut item = test_item("project:foo", "/tmp");

        let err = guard.execute(&mut item).await.unwrap_err();
        assert!(err.is_fatal_for_run());
        assert!(err.to_string().contains("192.168.1.1"));
        assert!(item.log_lines().iter().any(|l| l.contains("firewall/proxy")));
    }

    #[tokio::test]
    async fn test_resolution_failure_is_environment_error() {
        let resolver = Arc::new(StaticResolver::new());
        let guard = CheckIp::with_resolver(["missing.example"], 10, resolver);
        let mut item = test_item("project:foo", "/tmp");

        let err = guard.execute(&mut item).await.unwrap_err();
        assert!(matches!(err, PipelineError::Environment(_)));
    }

    #[tokio::test]
    async fn test_checks_first_item_then_every_interval() {
        let resolver = distinct_resolver();
        let guard = CheckIp::with_resolver(
            ["a.example", "b.example", "c.example"],
            3,
            resolver.clone(),
        );

        let mut checked = Vec::new();
        for _ in 0..7 {
            let mut item = test_item("project:foo", "/tmp");
            checked.push(guard.execute(&mut item).await.unwrap().is_ok());
        }

        assert_eq!(checked, vec![true, false, false, true, false, false, true]);
        let mut item = test_item("project:foo", "/tmp");
        assert_output_skipped(&guard.execute(&mut item).await.unwrap(), "IP check not due");
        assert_eq!(resolver.lookups(), 9);
        assert_eq!(guard.processed(), 8);
    }

    #[test]
    fn test_duplicate_hosts_are_collapsed() {
        let guard = CheckIp::with_resolver(["a", "a", "b"], 0, distinct_resolver());
        assert_eq!(guard.hosts.len(), 2);
        assert_eq!(guard.interval, 1);
    }
}
