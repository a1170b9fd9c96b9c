//! The bidding manager: every state-machine operation, run against an
//! explicit [`Storage`] handle and [`Notifier`].
//!
//! Operations are grouped by component:
//! - [`lifecycle`]: request status transitions
//! - [`session`]: opening, recording into and completing bidding sessions
//! - [`ledger`]: bid submission
//! - [`resolution`]: bid acceptance
//! - [`providers`]: provider account status
//!
//! Notifications are dispatched only after the state change they announce has
//! been committed, and a failed dispatch is logged, never propagated.

use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;

use crate::config::BiddingConfig;
use crate::domain::bid::Bid;
use crate::domain::notification::{Notification, NotificationRecord, Recipient};
use crate::domain::request::{RequestId, ServiceRequest};
use crate::domain::session::AnySession;
use crate::error::Result;
use crate::notify::Notifier;
use crate::storage::Storage;

pub mod ledger;
pub mod lifecycle;
pub mod providers;
pub mod resolution;
pub mod session;

pub use ledger::BidReceipt;
pub use providers::ProviderStatusUpdate;
pub use resolution::AcceptOutcome;
pub use session::{OpenSession, SessionOpened};

/// Coordinates requests, sessions and bids.
///
/// # Example
/// ```ignore
/// let storage = Arc::new(InMemoryStorage::new());
/// let manager = BiddingManager::new(storage, Arc::new(MockNotifier::new()))
///     .with_config(BiddingConfig::default());
///
/// manager.on_request_matched(request_id, providers, None).await?;
/// let receipt = manager.submit_bid(input).await?;
/// manager.accept_bid(receipt.bid_id, &owner_id).await?;
/// ```
pub struct BiddingManager<S: Storage + ?Sized, N: Notifier + ?Sized> {
    storage: Arc<S>,
    notifier: Arc<N>,
    config: BiddingConfig,
}

impl<S: Storage + ?Sized, N: Notifier + ?Sized> Clone for BiddingManager<S, N> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Storage + ?Sized, N: Notifier + ?Sized> BiddingManager<S, N> {
    /// Create a manager with the default configuration.
    pub fn new(storage: Arc<S>, notifier: Arc<N>) -> Self {
        Self {
            storage,
            notifier,
            config: BiddingConfig::default(),
        }
    }

    /// Set a custom configuration.
    pub fn with_config(mut self, config: BiddingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn config(&self) -> &BiddingConfig {
        &self.config
    }

    pub async fn get_request(&self, request_id: RequestId) -> Result<ServiceRequest> {
        self.storage.get_request(request_id).await
    }

    pub async fn list_bids(&self, request_id: RequestId) -> Result<Vec<Bid>> {
        // Surface unknown requests as 404 rather than an empty list
        self.storage.get_request(request_id).await?;
        self.storage.list_bids(request_id).await
    }

    pub async fn list_sessions(&self, request_id: RequestId) -> Result<Vec<AnySession>> {
        self.storage.list_sessions(request_id).await
    }

    /// Deliver one notification and log it. Never fails.
    async fn dispatch(&self, recipient: Recipient, notification: Notification) {
        let kind = notification.kind.as_str();

        let report = match self.notifier.notify(&recipient, &notification).await {
            Ok(report) => {
                let outcome = if report.delivered {
                    "delivered"
                } else {
                    "undelivered"
                };
                counter!("gavel_notifications_total", "kind" => kind, "outcome" => outcome)
                    .increment(1);
                if report.recipient_invalid {
                    tracing::warn!(
                        recipient = %recipient,
                        kind,
                        "Recipient has no valid devices"
                    );
                }
                report
            }
            Err(e) => {
                counter!("gavel_notifications_total", "kind" => kind, "outcome" => "error")
                    .increment(1);
                tracing::warn!(
                    recipient = %recipient,
                    kind,
                    error = %e,
                    "Notification dispatch failed"
                );
                Default::default()
            }
        };

        let record = NotificationRecord::new(recipient, &notification, &report, self.storage.now());
        if let Err(e) = self.storage.record_notification(&record).await {
            tracing::warn!(error = %e, kind, "Failed to record notification");
        }
    }

    /// Dispatch several notifications concurrently.
    async fn dispatch_all(&self, notifications: Vec<(Recipient, Notification)>) {
        join_all(
            notifications
                .into_iter()
                .map(|(recipient, notification)| self.dispatch(recipient, notification)),
        )
        .await;
    }
}
