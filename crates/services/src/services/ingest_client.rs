//! Transport for the `ingest_analytics_batch` RPC.

use std::time::Duration;

use async_trait::async_trait;
use models::{
    analytics_event::BatchedEvent,
    ingest::{IngestRequest, IngestResponse},
};
use reqwest::{Client, RequestBuilder, StatusCode};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use url::Url;

use super::config::{ConfigError, IngestConfig};

#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("unauthorized: api key rejected")]
    Unauthorized,
    #[error("json error: {0}")]
    Serde(String),
    #[error("batch rejected: {0}")]
    Rejected(String),
    #[error("missing base url or api key")]
    MissingCredentials,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Delivery of captured batches to the ingest endpoint
#[async_trait]
pub trait IngestTransport: Send + Sync {
    /// Deliver a batch and wait for the backend's answer
    async fn ingest_batch(&self, events: &[BatchedEvent]) -> Result<IngestResponse, IngestError>;

    /// Hand a batch off for delivery without waiting; the request should
    /// outlive the caller if at all possible
    fn send_keepalive(&self, events: Vec<BatchedEvent>);
}

/// HTTP client for the backend's REST RPC endpoint
#[derive(Debug, Clone)]
pub struct RpcIngestClient {
    http: Client,
    endpoint: Option<Url>,
    api_key: String,
    keepalive: TaskTracker,
}

impl RpcIngestClient {
    pub fn new(config: &IngestConfig) -> Result<Self, IngestError> {
        let mut builder =
            Client::builder().user_agent(concat!("contact-analytics/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| IngestError::Transport(e.to_string()))?;

        Self::with_http(http, config)
    }

    fn with_http(http: Client, config: &IngestConfig) -> Result<Self, IngestError> {
        let endpoint = if config.has_credentials() {
            Some(config.endpoint()?)
        } else {
            warn!("Analytics ingest base url or api key not configured - batches will be dropped");
            None
        };

        Ok(Self {
            http,
            endpoint,
            api_key: config.api_key.clone(),
            keepalive: TaskTracker::new(),
        })
    }

    /// Wait up to `grace` for keepalive requests still in flight.
    ///
    /// Returns `true` if all of them finished.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.keepalive.close();
        let drained = tokio::time::timeout(grace, self.keepalive.wait())
            .await
            .is_ok();
        self.keepalive.reopen();

        if !drained {
            warn!(
                pending = self.keepalive.len(),
                "Keepalive requests still in flight after {:?}", grace
            );
        }
        drained
    }

    fn request(&self, endpoint: &Url, events: &[BatchedEvent]) -> RequestBuilder {
        self.http
            .post(endpoint.clone())
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(&IngestRequest { events })
    }
}

#[async_trait]
impl IngestTransport for RpcIngestClient {
    async fn ingest_batch(&self, events: &[BatchedEvent]) -> Result<IngestResponse, IngestError> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or(IngestError::MissingCredentials)?;

        let res = self
            .request(endpoint, events)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = res.status();
        let body = res.text().await.map_err(map_reqwest_error)?;

        match status {
            s if s.is_success() => {
                IngestResponse::from_body(&body).map_err(|e| IngestError::Serde(e.to_string()))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(IngestError::Unauthorized),
            s => Err(IngestError::Http {
                status: s.as_u16(),
                body,
            }),
        }
    }

    fn send_keepalive(&self, events: Vec<BatchedEvent>) {
        let count = events.len();
        let Some(endpoint) = self.endpoint.as_ref() else {
            warn!(events = count, "Keepalive flush dropped: ingest credentials not configured");
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            warn!(events = count, "Keepalive flush dropped: no async runtime available");
            return;
        };

        let request = self.request(endpoint, &events);
        self.keepalive.spawn_on(
            async move {
                match request.send().await {
                    Ok(res) if res.status().is_success() => {
                        debug!(events = count, "Keepalive flush delivered");
                    }
                    Ok(res) => {
                        warn!(events = count, status = %res.status(), "Keepalive flush rejected");
                    }
                    Err(e) => {
                        warn!(events = count, error = %e, "Keepalive flush failed");
                    }
                }
            },
            &handle,
        );
    }
}

fn map_reqwest_error(e: reqwest::Error) -> IngestError {
    if e.is_timeout() {
        IngestError::Timeout
    } else {
        IngestError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use models::analytics_event::{AnalyticsEvent, VisitScope};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        task::JoinHandle,
    };

    use super::*;

    fn events(n: usize) -> Vec<BatchedEvent> {
        let scope = VisitScope::new("sess", "AB12CD", "public");
        (0..n)
            .map(|i| {
                BatchedEvent::new(
                    AnalyticsEvent::page_view(&scope, &format!("page-{i}"), Utc::now()),
                    Utc::now(),
                )
            })
            .collect()
    }

    #[test]
    fn test_request_carries_key_twice_and_events() {
        let config = IngestConfig::new("https://abc.supabase.co", "anon-key");
        let client = RpcIngestClient::new(&config).unwrap();
        let endpoint = config.endpoint().unwrap();
        let batch = events(2);

        let request = client.request(&endpoint, &batch).build().unwrap();

        assert_eq!(request.method(), &reqwest::Method::POST);
        assert_eq!(
            request.url().as_str(),
            "https://abc.supabase.co/rest/v1/rpc/ingest_analytics_batch"
        );
        assert_eq!(request.headers()["apikey"], "anon-key");
        assert_eq!(request.headers()["authorization"], "Bearer anon-key");
        assert_eq!(request.headers()["content-type"], "application/json");

        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value["events"][0]["data"]["page_type"], "page-0");
        assert_eq!(value["events"][1]["data"]["page_type"], "page-1");
    }

    #[test]
    fn test_invalid_base_url_is_config_error() {
        let config = IngestConfig::new("::nope::", "anon-key");
        assert!(matches!(
            RpcIngestClient::new(&config),
            Err(IngestError::Config(ConfigError::InvalidBaseUrl { .. }))
        ));
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let client = RpcIngestClient::new(&IngestConfig::new("", "")).unwrap();

        let result = client.ingest_batch(&events(1)).await;
        assert!(matches!(result, Err(IngestError::MissingCredentials)));

        // Dropped without spawning anything
        client.send_keepalive(events(3));
        assert!(client.keepalive.is_empty());
        assert!(client.drain(Duration::from_millis(10)).await);
    }

    /// Serve a single canned HTTP response on a local port.
    ///
    /// Returns the base url and a handle yielding the raw request.
    async fn serve_once(status: u16, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request
        });

        (base_url, handle)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let content_length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8(buf).unwrap()
    }

    fn local_client(base_url: &str) -> RpcIngestClient {
        let http = Client::builder().no_proxy().build().unwrap();
        RpcIngestClient::with_http(http, &IngestConfig::new(base_url, "anon-key")).unwrap()
    }

    fn request_body(request: &str) -> serde_json::Value {
        let (_, body) = request.split_once("\r\n\r\n").unwrap();
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_batch_parses_success() {
        let (base_url, server) = serve_once(200, r#"{"success":true,"processed":2}"#).await;
        let client = local_client(&base_url);

        let response = client.ingest_batch(&events(2)).await.unwrap();
        assert_eq!(response.success, Some(true));
        assert_eq!(response.processed, Some(2));
        assert!(!response.is_rejected());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /rest/v1/rpc/ingest_analytics_batch "));
        let head = request.to_lowercase();
        assert!(head.contains("apikey: anon-key"));
        assert!(head.contains("authorization: bearer anon-key"));
        assert_eq!(request_body(&request)["events"][1]["data"]["page_type"], "page-1");
    }

    #[tokio::test]
    async fn test_ingest_batch_returns_logical_rejection() {
        let (base_url, server) =
            serve_once(200, r#"{"success":false,"error":"unknown owner"}"#).await;
        let client = local_client(&base_url);

        let response = client.ingest_batch(&events(1)).await.unwrap();
        assert!(response.is_rejected());
        assert_eq!(response.failure_message(), "unknown owner");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ingest_batch_auth_failures_map_to_unauthorized() {
        for status in [401, 403] {
            let (base_url, server) = serve_once(status, r#"{"message":"denied"}"#).await;
            let client = local_client(&base_url);

            let result = client.ingest_batch(&events(1)).await;
            assert!(
                matches!(result, Err(IngestError::Unauthorized)),
                "status {status}: {result:?}"
            );
            server.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_ingest_batch_other_status_keeps_body() {
        let (base_url, server) = serve_once(500, "boom").await;
        let client = local_client(&base_url);

        match client.ingest_batch(&events(1)).await {
            Err(IngestError::Http { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected http error, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_request_is_sent_and_drained() {
        let (base_url, server) = serve_once(200, r#"{"success":true}"#).await;
        let client = local_client(&base_url);

        client.send_keepalive(events(3));
        assert!(client.drain(Duration::from_secs(5)).await);
        assert!(client.keepalive.is_empty());

        let request = server.await.unwrap();
        let head = request.to_lowercase();
        assert!(head.contains("apikey: anon-key"));
        assert!(head.contains("authorization: bearer anon-key"));
        let body = request_body(&request);
        assert_eq!(body["events"].as_array().map(Vec::len), Some(3));
        assert_eq!(body["events"][0]["data"]["page_type"], "page-0");
    }
}
