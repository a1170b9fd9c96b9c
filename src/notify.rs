//! Notification delivery.
//!
//! [`Notifier`] is the capability the bidding manager depends on:
//! `notify(recipient, notification) -> DeliveryReport`. [`FcmNotifier`]
//! fans a notification out to every registered device of the recipient over a
//! [`PushTransport`] and prunes tokens the push service reports as invalid.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::PushConfig;
use crate::domain::notification::{DeliveryReport, Notification, Recipient};
use crate::error::{GavelError, Result};
use crate::push::{PushMessage, PushTransport, ReqwestPushTransport};
use crate::storage::DeviceRegistry;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient: &Recipient,
        notification: &Notification,
    ) -> Result<DeliveryReport>;
}

/// Push notifier that resolves device tokens through a [`DeviceRegistry`].
pub struct FcmNotifier<T: PushTransport, R: DeviceRegistry + ?Sized> {
    transport: T,
    registry: Arc<R>,
    timeout_ms: u64,
}

impl<R: DeviceRegistry + ?Sized> FcmNotifier<ReqwestPushTransport, R> {
    pub fn from_config(config: &PushConfig, registry: Arc<R>) -> Self {
        Self::new(
            ReqwestPushTransport::new(&config.endpoint, &config.project_id, &config.access_token),
            registry,
        )
        .with_timeout_ms(config.timeout_ms)
    }
}

impl<T: PushTransport, R: DeviceRegistry + ?Sized> FcmNotifier<T, R> {
    pub fn new(transport: T, registry: Arc<R>) -> Self {
        Self {
            transport,
            registry,
            timeout_ms: 10_000,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[async_trait]
impl<T: PushTransport, R: DeviceRegistry + ?Sized> Notifier for FcmNotifier<T, R> {
    #[tracing::instrument(skip(self, notification), fields(recipient = %recipient, kind = notification.kind.as_str()))]
    async fn notify(
        &self,
        recipient: &Recipient,
        notification: &Notification,
    ) -> Result<DeliveryReport> {
        let tokens = self.registry.device_tokens(recipient).await?;
        if tokens.is_empty() {
            tracing::warn!("No device tokens registered for recipient");
            return Ok(DeliveryReport {
                recipient_invalid: true,
                ..Default::default()
            });
        }

        let mut report = DeliveryReport::default();
        let mut invalid_tokens = Vec::new();

        for token in &tokens {
            let message = PushMessage {
                token: token.clone(),
                notification: notification.clone(),
            };
            match self.transport.send(&message, self.timeout_ms).await {
                Ok(response) if response.is_success() => report.sent += 1,
                Ok(response) => {
                    report.failed += 1;
                    if response.is_invalid_token() {
                        invalid_tokens.push(token.clone());
                    }
                    tracing::warn!(
                        status = response.status,
                        body = %response.body,
                        "Push service rejected message"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(error = %e, "Failed to send push message");
                }
            }
        }

        if !invalid_tokens.is_empty() {
            // Cleanup is best effort; a failure here must not hide the report.
            match self
                .registry
                .remove_device_tokens(recipient, &invalid_tokens)
                .await
            {
                Ok(removed) => tracing::info!(removed, "Removed invalid device tokens"),
                Err(e) => tracing::error!(error = %e, "Failed to remove invalid device tokens"),
            }
        }

        report.delivered = report.sent > 0;
        report.recipient_invalid = invalid_tokens.len() == tokens.len();

        tracing::info!(
            sent = report.sent,
            failed = report.failed,
            "Push notification dispatched"
        );

        Ok(report)
    }
}

/// Notifier used when no push service is configured: logs and reports
/// nothing delivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        recipient: &Recipient,
        notification: &Notification,
    ) -> Result<DeliveryReport> {
        tracing::info!(
            recipient = %recipient,
            kind = notification.kind.as_str(),
            title = %notification.title,
            "Push disabled, notification logged only"
        );
        Ok(DeliveryReport::default())
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Record of a call made to the mock notifier.
#[derive(Debug, Clone)]
pub struct MockNotification {
    pub recipient: Recipient,
    pub notification: Notification,
}

/// Notifier that records every call and answers with a configurable report.
#[derive(Clone, Default)]
pub struct MockNotifier {
    calls: Arc<Mutex<Vec<MockNotification>>>,
    failing: Arc<Mutex<Vec<Recipient>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every notify call for `recipient` fail with a transport error.
    pub fn fail_for(&self, recipient: Recipient) {
        self.failing.lock().push(recipient);
    }

    pub fn get_calls(&self) -> Vec<MockNotification> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, recipient: &Recipient) -> Vec<Notification> {
        self.calls
            .lock()
            .iter()
            .filter(|c| &c.recipient == recipient)
            .map(|c| c.notification.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(
        &self,
        recipient: &Recipient,
        notification: &Notification,
    ) -> Result<DeliveryReport> {
        self.calls.lock().push(MockNotification {
            recipient: recipient.clone(),
            notification: notification.clone(),
        });

        if self.failing.lock().contains(recipient) {
            return Err(GavelError::Other(anyhow::anyhow!(
                "Mock delivery failure for {}",
                recipient
            )));
        }

        Ok(DeliveryReport {
            delivered: true,
            recipient_invalid: false,
            sent: 1,
            failed: 0,
        })
    }
}
