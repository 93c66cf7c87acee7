//! Remote endpoint transport.
//!
//! The CRUD services expose `GET /api/health` and
//! `POST /api/<resource>`; this module hides how those calls are made.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use jobtrack_common::{Error, Record, Result};

/// User agent sent with every request.
const USER_AGENT: &str = "jobtrack-sync/0.1";

/// Header carrying the record id so a service can drop duplicate deliveries.
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Longest response body quoted in an error message.
const MAX_ERROR_BODY: usize = 200;

/// Transport used to reach a remote endpoint.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Get the transport name (e.g., "http", "stub").
    fn name(&self) -> &str;

    /// Check that the service behind `endpoint` is ready.
    ///
    /// # Errors
    /// - `RemoteUnreachable` on transport failure
    /// - `RemoteRejected` on any status other than 200
    async fn health(&self, endpoint: &Url) -> Result<()>;

    /// Deliver a record's payload to its resource collection.
    ///
    /// # Errors
    /// - `RemoteUnreachable` on transport failure
    /// - `RemoteRejected` on a non-2xx status or a non-JSON success body
    async fn submit(&self, endpoint: &Url, record: &Record) -> Result<()>;
}

/// Build `<endpoint>/api/<path>`, keeping any path prefix of the endpoint.
pub fn api_url(endpoint: &Url, path: &str) -> Result<Url> {
    let base = endpoint.as_str().trim_end_matches('/');
    let url = format!("{}/api/{}", base, path.trim_start_matches('/'));
    Url::parse(&url).map_err(|e| Error::InvalidInput(format!("Invalid endpoint URL {}: {}", url, e)))
}

/// HTTP transport backed by reqwest.
pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    ///
    /// `request_timeout` bounds each request at the client level; callers
    /// still apply their own per-attempt deadline.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http })
    }

    /// Convert a non-success response into an error.
    async fn rejection(response: reqwest::Response) -> Error {
        let status = response.status();
        let mut message = response.text().await.unwrap_or_default();
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        if message.is_empty() {
            message = status.canonical_reason().unwrap_or("no reason").to_string();
        }
        Error::RemoteRejected {
            status: status.as_u16(),
            message,
        }
    }
}

fn transport_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::RemoteUnreachable(format!("{} timed out: {}", context, err))
    } else {
        Error::RemoteUnreachable(format!("{} failed: {}", context, err))
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn health(&self, endpoint: &Url) -> Result<()> {
        let url = api_url(endpoint, "health")?;

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport_error("Health check", e))?;

        if response.status() != StatusCode::OK {
            return Err(Self::rejection(response).await);
        }

        debug!("Health check passed for {}", url);
        Ok(())
    }

    async fn submit(&self, endpoint: &Url, record: &Record) -> Result<()> {
        let url = api_url(endpoint, record.kind.resource())?;

        let response = self
            .http
            .post(url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_HEADER, record.id.as_str())
            .json(&record.payload)
            .send()
            .await
            .map_err(|e| transport_error("Submission", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::rejection(response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| transport_error("Reading response", e))?;

        if !body.trim().is_empty() && serde_json::from_str::<serde_json::Value>(&body).is_err() {
            return Err(Error::RemoteRejected {
                status: status.as_u16(),
                message: "success response is not JSON".to_string(),
            });
        }

        debug!("Submitted {} to {}", record.id, url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobtrack_common::RecordKind;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_api_url() {
        let root = Url::parse("http://localhost:3000").unwrap();
        assert_eq!(
            api_url(&root, "health").unwrap().as_str(),
            "http://localhost:3000/api/health"
        );

        let prefixed = Url::parse("https://example.com/tracker/").unwrap();
        assert_eq!(
            api_url(&prefixed, "applications").unwrap().as_str(),
            "https://example.com/tracker/api/applications"
        );
    }

    /// Serve one canned HTTP response per connection and return the
    /// request heads seen.
    async fn serve(responses: Vec<&'static str>) -> (Url, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let mut seen = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];

                // Read the head, then as much body as Content-Length says.
                let head_end = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let body_len = head
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                while buf.len() < head_end + body_len {
                    let n = socket.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                }

                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
                seen.push(String::from_utf8_lossy(&buf).to_string());
            }
            seen
        });

        (Url::parse(&format!("http://{}", addr)).unwrap(), task)
    }

    const OK_JSON: &str =
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 15\r\nconnection: close\r\n\r\n{\"status\":\"ok\"}";
    const CREATED: &str =
        "HTTP/1.1 201 Created\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}";
    const SERVER_ERROR: &str =
        "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 4\r\nconnection: close\r\n\r\nboom";
    const NOT_JSON: &str =
        "HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello";

    #[tokio::test]
    async fn test_health_ok() {
        let (endpoint, server) = serve(vec![OK_JSON]).await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();

        transport.health(&endpoint).await.unwrap();

        let seen = server.await.unwrap();
        assert!(seen[0].starts_with("GET /api/health"));
    }

    #[tokio::test]
    async fn test_submit_posts_payload() {
        let (endpoint, server) = serve(vec![CREATED]).await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let record = Record::new(RecordKind::Application, json!({"company": "Acme"}));

        transport.submit(&endpoint, &record).await.unwrap();

        let seen = server.await.unwrap();
        assert!(seen[0].starts_with("POST /api/applications"));
        assert!(seen[0].contains("{\"company\":\"Acme\"}"));
        assert!(seen[0]
            .to_ascii_lowercase()
            .contains(&format!("idempotency-key: {}", record.id)));
    }

    #[tokio::test]
    async fn test_submit_server_error_is_rejection() {
        let (endpoint, _server) = serve(vec![SERVER_ERROR]).await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let record = Record::new(RecordKind::Contact, json!({"name": "Jo"}));

        let result = transport.submit(&endpoint, &record).await;
        match result {
            Err(Error::RemoteRejected { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_non_json_success_is_rejection() {
        let (endpoint, _server) = serve(vec![NOT_JSON]).await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let record = Record::new(RecordKind::Contact, json!({}));

        let result = transport.submit(&endpoint, &record).await;
        assert!(matches!(result, Err(Error::RemoteRejected { status: 200, .. })));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Url::parse(&format!("http://{}", addr)).unwrap();
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();

        let result = transport.health(&endpoint).await;
        assert!(matches!(result, Err(Error::RemoteUnreachable(_))));
    }
}
