//! HTTP remote queue using the IronMQ v3 REST API.
//!
//! All operations address a single queue under
//! `{base_url}/3/projects/{project_id}/queues/{queue_name}` and authenticate
//! with an `OAuth` token header. Non-success responses carry a JSON body of the
//! form `{"msg": "..."}`; 404 bodies are classified into a
//! [`NotFoundReason`](crate::error::NotFoundReason)
//! so callers never inspect the text themselves.
//!
//! ## Example
//!
//! ```no_run
//! use polled_queue::remote::{HttpRemoteConfig, HttpRemoteQueue, RemoteQueue};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HttpRemoteConfig {
//!     project_id: "my-project".to_string(),
//!     token: "secret-token".to_string(),
//!     queue_name: "emails".to_string(),
//!     ..Default::default()
//! };
//!
//! let remote = HttpRemoteQueue::new(config)?;
//! let id = remote.push("aGVsbG8=".to_string(), 0).await?;
//! # Ok(())
//! # }
//! ```

use super::{QueueInfo, RemoteMessage, RemoteQueue, ReservedRef};
use crate::error::{ConfigurationError, RemoteError};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;

// ============================================================================
// Configuration
// ============================================================================

/// Connection settings for the HTTP remote
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRemoteConfig {
    /// Service root, e.g. `https://mq-aws-us-east-1-1.iron.io`
    pub base_url: String,

    pub project_id: String,

    /// OAuth token sent on every request
    pub token: String,

    pub queue_name: String,

    /// Request timeout in seconds, added on top of any long-poll wait
    pub request_timeout_seconds: u64,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://mq-aws-us-east-1-1.iron.io".to_string(),
            project_id: String::new(),
            token: String::new(),
            queue_name: String::new(),
            request_timeout_seconds: 60,
        }
    }
}

impl fmt::Debug for HttpRemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemoteConfig")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .field("token", &"<redacted>")
            .field("queue_name", &self.queue_name)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

impl HttpRemoteConfig {
    /// Validate required settings
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (key, value) in [
            ("project_id", &self.project_id),
            ("token", &self.token),
            ("queue_name", &self.queue_name),
        ] {
            if value.is_empty() {
                return Err(ConfigurationError::Missing {
                    key: key.to_string(),
                });
            }
        }

        url::Url::parse(&self.base_url).map_err(|e| ConfigurationError::Invalid {
            message: format!("base_url '{}' is not a valid URL: {}", self.base_url, e),
        })?;

        if self.request_timeout_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "request_timeout_seconds must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct PushResponse {
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReserveResponse {
    #[serde(default)]
    messages: Vec<RemoteMessage>,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    queue: QueueInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    msg: String,
}

// ============================================================================
// HTTP Remote Queue
// ============================================================================

/// Remote queue reached over HTTP
///
/// The client is cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct HttpRemoteQueue {
    http_client: HttpClient,
    config: HttpRemoteConfig,
    queue_url: String,
}

impl HttpRemoteQueue {
    /// Create new HTTP remote from validated configuration
    pub fn new(config: HttpRemoteConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let http_client = HttpClient::builder()
            .build()
            .map_err(|e| ConfigurationError::Invalid {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        let queue_url = format!(
            "{}/3/projects/{}/queues/{}",
            config.base_url.trim_end_matches('/'),
            urlencoding::encode(&config.project_id),
            urlencoding::encode(&config.queue_name),
        );

        Ok(Self {
            http_client,
            config,
            queue_url,
        })
    }

    /// Full URL of the queue resource
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Send a request and return the raw success body
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        extra_timeout: Duration,
    ) -> Result<String, RemoteError> {
        let url = format!("{}{}", self.queue_url, path);
        debug!(method = %method, url = %url, "Sending remote queue request");

        let mut request = self
            .http_client
            .request(method, &url)
            .header("Authorization", format!("OAuth {}", self.config.token))
            .timeout(self.config.request_timeout().saturating_add(extra_timeout));

        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Transport {
                    message: format!("Request timeout: {}", e),
                }
            } else if e.is_connect() {
                RemoteError::Transport {
                    message: format!("Connection failed: {}", e),
                }
            } else {
                RemoteError::Transport {
                    message: format!("HTTP request failed: {}", e),
                }
            }
        })?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| RemoteError::Transport {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(Self::parse_error_response(&response_body, status.as_u16()));
        }

        Ok(response_body)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        extra_timeout: Duration,
    ) -> Result<T, RemoteError> {
        let text = self.send(method, path, body, extra_timeout).await?;
        serde_json::from_str(&text).map_err(|e| RemoteError::InvalidResponse {
            message: format!("Failed to parse response: {}", e),
        })
    }

    /// Map a non-success response to a typed error
    fn parse_error_response(body: &str, status_code: u16) -> RemoteError {
        let message = serde_json::from_str::<ErrorResponse>(body)
            .map(|e| e.msg)
            .unwrap_or_else(|_| {
                if body.is_empty() {
                    format!("HTTP {}", status_code)
                } else {
                    body.to_string()
                }
            });

        RemoteError::from_status(status_code, message)
    }
}

impl fmt::Debug for HttpRemoteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemoteQueue")
            .field("config", &self.config)
            .field("queue_url", &self.queue_url)
            .finish()
    }
}

#[async_trait]
impl RemoteQueue for HttpRemoteQueue {
    fn name(&self) -> &str {
        &self.config.queue_name
    }

    async fn push(&self, body: String, delay_secs: u64) -> Result<String, RemoteError> {
        let payload = json!({
            "messages": [{ "body": body, "delay": delay_secs }]
        });

        let response: PushResponse = self
            .send_json(Method::POST, "/messages", Some(payload), Duration::ZERO)
            .await?;

        response
            .ids
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidResponse {
                message: "push response contained no message id".to_string(),
            })
    }

    async fn long_poll(
        &self,
        n: usize,
        reservation_secs: u64,
        wait_secs: u64,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        let mut payload = json!({
            "n": n,
            "wait": wait_secs,
            "delete": false,
        });
        // Zero means "use the queue's configured timeout"
        if reservation_secs > 0 {
            payload["timeout"] = json!(reservation_secs);
        }

        let response: ReserveResponse = self
            .send_json(
                Method::POST,
                "/reservations",
                Some(payload),
                Duration::from_secs(wait_secs),
            )
            .await?;

        Ok(response.messages)
    }

    async fn release(
        &self,
        id: &str,
        reservation_id: &str,
        delay_secs: u64,
    ) -> Result<(), RemoteError> {
        let path = format!("/messages/{}/release", urlencoding::encode(id));
        let payload = json!({ "reservation_id": reservation_id, "delay": delay_secs });

        self.send(Method::POST, &path, Some(payload), Duration::ZERO)
            .await
            .map(|_| ())
    }

    async fn delete(&self, id: &str, reservation_id: &str) -> Result<(), RemoteError> {
        let path = format!("/messages/{}", urlencoding::encode(id));
        let payload = json!({ "reservation_id": reservation_id });

        self.send(Method::DELETE, &path, Some(payload), Duration::ZERO)
            .await
            .map(|_| ())
    }

    async fn delete_reserved(&self, messages: &[ReservedRef]) -> Result<(), RemoteError> {
        let payload = json!({ "ids": messages });

        self.send(Method::DELETE, "/messages", Some(payload), Duration::ZERO)
            .await
            .map(|_| ())
    }

    async fn clear(&self) -> Result<(), RemoteError> {
        self.send(Method::DELETE, "/messages", Some(json!({})), Duration::ZERO)
            .await
            .map(|_| ())
    }

    async fn info(&self) -> Result<QueueInfo, RemoteError> {
        let response: InfoResponse = self
            .send_json(Method::GET, "", None, Duration::ZERO)
            .await?;
        Ok(response.queue)
    }

    async fn create_queue(&self) -> Result<(), RemoteError> {
        let payload = json!({ "queue": {} });

        match self.send(Method::PUT, "", Some(payload), Duration::ZERO).await {
            Ok(_) => Ok(()),
            // Already provisioned
            Err(RemoteError::Status { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
