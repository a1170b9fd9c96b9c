//! Push transport abstraction for delivering device messages.
//!
//! This module defines the `PushTransport` trait to abstract the HTTP call to
//! the push service, enabling testability with mock implementations.

use crate::domain::notification::Notification;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Response from the push service for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
}

impl PushResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            body: r#"{"name":"projects/test/messages/1"}"#.to_string(),
        }
    }

    /// The response the push service gives for a token that is no longer
    /// registered.
    pub fn unregistered() -> Self {
        Self {
            status: 404,
            body: r#"{"error":{"status":"NOT_FOUND","details":[{"errorCode":"UNREGISTERED"}]}}"#
                .to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the token itself is bad (as opposed to a transient failure).
    pub fn is_invalid_token(&self) -> bool {
        self.status == 404
            || self.body.contains("UNREGISTERED")
            || (self.status == 400 && self.body.contains("INVALID_ARGUMENT"))
    }
}

/// A single device message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub token: String,
    pub notification: Notification,
}

impl PushMessage {
    /// Wire body in FCM HTTP v1 shape, with an APNs block so iOS shows an
    /// alert with badge and sound.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "message": {
                "token": self.token,
                "notification": {
                    "title": self.notification.title,
                    "body": self.notification.body,
                },
                "data": self.notification.data,
                "apns": {
                    "payload": {
                        "aps": {
                            "alert": {
                                "title": self.notification.title,
                                "body": self.notification.body,
                            },
                            "badge": 1,
                            "sound": "default",
                            "category": self.notification.kind.category(),
                        }
                    }
                }
            }
        })
    }
}

/// Trait for sending push messages.
///
/// This abstraction allows for different implementations (production vs. testing)
/// and makes the notifier testable without making real HTTP calls.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Send one message.
    ///
    /// # Errors
    /// Returns an error if the request fails due to network issues or times out.
    /// A non-2xx answer from the service is *not* an error; it is returned as
    /// a [`PushResponse`] for classification.
    async fn send(&self, message: &PushMessage, timeout_ms: u64) -> Result<PushResponse>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production push transport posting to an FCM-compatible endpoint.
#[derive(Clone)]
pub struct ReqwestPushTransport {
    client: reqwest::Client,
    url: String,
    access_token: String,
}

impl ReqwestPushTransport {
    /// `endpoint` is the service base URL (e.g. `https://fcm.googleapis.com`).
    pub fn new(endpoint: &str, project_id: &str, access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!(
                "{}/v1/projects/{}/messages:send",
                endpoint.trim_end_matches('/'),
                project_id
            ),
            access_token: access_token.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PushTransport for ReqwestPushTransport {
    #[tracing::instrument(skip(self, message), fields(kind = message.notification.kind.as_str()))]
    async fn send(&self, message: &PushMessage, timeout_ms: u64) -> Result<PushResponse> {
        tracing::debug!(url = %self.url, timeout_ms, "Sending push message");

        let mut req = self
            .client
            .post(&self.url)
            .timeout(Duration::from_millis(timeout_ms))
            .json(&message.to_json());

        // Only add Authorization header if a token is configured
        if !self.access_token.is_empty() {
            req = req.bearer_auth(&self.access_token);
        }

        let response = req.send().await.map_err(|e| {
            tracing::error!(url = %self.url, error = %e, "Push request failed");
            e
        })?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::debug!(status, response_len = body.len(), "Push request completed");

        Ok(PushResponse { status, body })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock push transport for testing.
///
/// Responses are configured per device token and returned in FIFO order;
/// tokens without a configured response get `200 OK`.
#[derive(Clone, Default)]
pub struct MockPushTransport {
    responses: Arc<Mutex<HashMap<String, Vec<Result<PushResponse>>>>>,
    calls: Arc<Mutex<Vec<PushMessage>>>,
}

impl MockPushTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predetermined response for a device token. Multiple responses
    /// for the same token are returned in FIFO order.
    pub fn add_response(&self, token: &str, response: Result<PushResponse>) {
        self.responses
            .lock()
            .entry(token.to_string())
            .or_default()
            .push(response);
    }

    /// Get all messages that have been sent.
    pub fn get_calls(&self) -> Vec<PushMessage> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl PushTransport for MockPushTransport {
    async fn send(&self, message: &PushMessage, _timeout_ms: u64) -> Result<PushResponse> {
        self.calls.lock().push(message.clone());

        let configured = {
            let mut responses = self.responses.lock();
            responses
                .get_mut(&message.token)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        configured.unwrap_or_else(|| Ok(PushResponse::ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::provider::{ProviderId, ProviderStatus};

    fn message(token: &str) -> PushMessage {
        PushMessage {
            token: token.to_string(),
            notification: Notification::status_changed(
                &ProviderId::new("p1"),
                ProviderStatus::Verified,
            ),
        }
    }

    #[test]
    fn test_wire_body_shape() {
        let body = message("tok-1").to_json();
        assert_eq!(body["message"]["token"], "tok-1");
        assert_eq!(body["message"]["notification"]["title"], "Account Verified!");
        assert_eq!(body["message"]["data"]["type"], "status_changed");
        assert_eq!(
            body["message"]["apns"]["payload"]["aps"]["category"],
            "STATUS_UPDATE"
        );
        assert_eq!(body["message"]["apns"]["payload"]["aps"]["badge"], 1);
    }

    #[test]
    fn test_invalid_token_classification() {
        assert!(PushResponse::unregistered().is_invalid_token());
        assert!(
            PushResponse {
                status: 400,
                body: r#"{"error":{"status":"INVALID_ARGUMENT"}}"#.to_string()
            }
            .is_invalid_token()
        );
        let unavailable = PushResponse {
            status: 503,
            body: "unavailable".to_string(),
        };
        assert!(!unavailable.is_invalid_token());
        assert!(!unavailable.is_success());
        assert!(PushResponse::ok().is_success());
    }

    #[test]
    fn test_transport_url() {
        let t = ReqwestPushTransport::new("https://fcm.googleapis.com/", "magic-home", "");
        assert_eq!(
            t.url(),
            "https://fcm.googleapis.com/v1/projects/magic-home/messages:send"
        );
    }

    #[tokio::test]
    async fn test_mock_transport_fifo_then_default() {
        let mock = MockPushTransport::new();
        mock.add_response("tok", Ok(PushResponse::unregistered()));

        let first = mock.send(&message("tok"), 1000).await.unwrap();
        assert_eq!(first.status, 404);
        let second = mock.send(&message("tok"), 1000).await.unwrap();
        assert_eq!(second.status, 200);
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.get_calls()[0].token, "tok");
    }
}
