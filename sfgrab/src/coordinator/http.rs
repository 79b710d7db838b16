//! HTTP implementation of the coordinator protocol.

use super::Coordinator;
use crate::errors::PipelineError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;

const API_VERSION: &str = "2";

/// Talks to a tracker over JSON-over-HTTP.
///
/// Endpoints are relative to the tracker URL: `/request`, `/upload`,
/// `/done` and `/fail`.
#[derive(Debug, Clone)]
pub struct HttpCoordinator {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCoordinator {
    /// Creates a client for the tracker at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_client(base_url, client))
    }

    /// Creates a client reusing an existing `reqwest::Client`.
    #[must_use]
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Returns the full URL of an endpoint.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(StatusCode, String), PipelineError> {
        let url = self.endpoint(path);
        tracing::debug!(url = %url, "Coordinator request");
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }
}

fn unexpected(path: &str, status: StatusCode, body: &str) -> PipelineError {
    PipelineError::Coordinator(format!(
        "{path} returned {}: {}",
        status.as_u16(),
        body.trim()
    ))
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn request_item(
        &self,
        downloader: &str,
        version: &str,
    ) -> Result<Option<String>, PipelineError> {
        let body = json!({
            "downloader": downloader,
            "api_version": API_VERSION,
            "version": version,
        });
        let (status, text) = self.post("request", &body).await?;

        match status.as_u16() {
            200 => {
                let item = text.trim();
                Ok((!item.is_empty()).then(|| item.to_string()))
            }
            404 => Ok(None),
            420 | 429 => {
                tracing::warn!(status = status.as_u16(), "Tracker rate limiting is active");
                Ok(None)
            }
            _ => Err(unexpected("request", status, &text)),
        }
    }

    async fn upload_target(
        &self,
        item: &str,
        downloader: &str,
        version: &str,
    ) -> Result<String, PipelineError> {
        let body = json!({
            "item": item,
            "downloader": downloader,
            "api_version": API_VERSION,
            "version": version,
        });
        let (status, text) = self.post("upload", &body).await?;

        let target = text.trim();
        if status == StatusCode::OK && !target.is_empty() {
            Ok(target.to_string())
        } else {
            Err(unexpected("upload", status, &text))
        }
    }

    async fn send_done(&self, item: &str, stats: &serde_json::Value) -> Result<(), PipelineError> {
        let mut body = stats.clone();
        if let serde_json::Value::Object(ref mut map) = body {
            map.insert("item".to_string(), json!(item));
        }
        let (status, text) = self.post("done", &body).await?;

        if status.is_success() {
            Ok(())
        } else {
            Err(unexpected("done", status, &text))
        }
    }

    async fn fail_item(
        &self,
        item: &str,
        downloader: &str,
        version: &str,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let body = json!({
            "item": item,
            "downloader": downloader,
            "version": version,
            "reason": reason,
        });
        let (status, text) = self.post("fail", &body).await?;

        if status.is_success() {
            Ok(())
        } else {
            Err(unexpected("fail", status, &text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Serves one request with `status` and `body`; the handle yields the raw request.
    async fn respond_once(status: u16, body: &'static str) -> (HttpCoordinator, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status} Tracker\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request
        });
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        (HttpCoordinator::with_client(format!("http://{addr}/tracker/"), client), handle)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn test_request_item_returns_trimmed_name() {
        let (coordinator, server) = respond_once(200, "project:foo\n").await;

        let item = coordinator.request_item("me", "20150614.01").await.unwrap();

        assert_eq!(item.as_deref(), Some("project:foo"));
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /tracker/request "), "{request}");
        assert!(request.contains("\"downloader\":\"me\""));
        assert!(request.contains("\"api_version\":\"2\""));
    }

    #[tokio::test]
    async fn test_request_item_without_work() {
        for (status, body) in [(200, ""), (404, "no items"), (420, "slow down"), (429, "slow down")] {
            let (coordinator, server) = respond_once(status, body).await;
            let item = coordinator.request_item("me", "1").await.unwrap();
            assert_eq!(item, None, "status {status}");
            server.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_item_server_error_is_retryable() {
        let (coordinator, server) = respond_once(500, "boom").await;

        let err = coordinator.request_item("me", "1").await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Coordinator error: request returned 500: boom");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_target() {
        let (coordinator, server) = respond_once(200, "rsync://storage/sourceforge/\n").await;
        let target = coordinator.upload_target("project:foo", "me", "1").await.unwrap();
        assert_eq!(target, "rsync://storage/sourceforge/");
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /tracker/upload "), "{request}");
        assert!(request.contains("\"item\":\"project:foo\""));

        let (coordinator, server) = respond_once(200, "  ").await;
        let err = coordinator.upload_target("project:foo", "me", "1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Coordinator(_)));
        server.await.unwrap();

        let (coordinator, server) = respond_once(403, "nope").await;
        let err = coordinator.upload_target("project:foo", "me", "1").await.unwrap_err();
        assert!(err.to_string().contains("upload returned 403"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_done_merges_item_into_stats() {
        let (coordinator, server) = respond_once(200, "OK").await;
        coordinator
            .send_done("project:foo", &json!({"bytes": {"data": 12}}))
            .await
            .unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /tracker/done "), "{request}");
        assert!(request.contains("\"item\":\"project:foo\""));
        assert!(request.contains("\"bytes\":{\"data\":12}"));

        let (coordinator, server) = respond_once(502, "bad gateway").await;
        let err = coordinator.send_done("project:foo", &json!({})).await.unwrap_err();
        assert!(err.is_retryable());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_item_sends_reason() {
        let (coordinator, server) = respond_once(200, "").await;
        coordinator
            .fail_item("project:foo", "me", "1", "WgetDownload: exit code 3")
            .await
            .unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /tracker/fail "), "{request}");
        assert!(request.contains("\"reason\":\"WgetDownload: exit code 3\""));

        let (coordinator, server) = respond_once(503, "down").await;
        let err = coordinator.fail_item("project:foo", "me", "1", "x").await.unwrap_err();
        assert!(err.to_string().contains("fail returned 503"));
        server.await.unwrap();
    }

    #[test]
    fn test_endpoint_joins_cleanly() {
        let coordinator = HttpCoordinator::with_client(
            "http://tracker.nerds.io/sourceforge-rsync/",
            reqwest::Client::new(),
        );
        assert_eq!(
            coordinator.endpoint("/request"),
            "http://tracker.nerds.io/sourceforge-rsync/request"
        );
        assert_eq!(
            coordinator.endpoint("done"),
            "http://tracker.nerds.io/sourceforge-rsync/done"
        );
    }

    #[test]
    fn test_unexpected_status_message() {
        let err = unexpected("upload", StatusCode::INTERNAL_SERVER_ERROR, " boom\n");
        assert_eq!(err.to_string(), "Coordinator error: upload returned 500: boom");
        assert!(err.is_retryable());
    }
}
