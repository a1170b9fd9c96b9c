//! Notification payloads sent to customers and providers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bid::{BidId, PriceBenchmark};
use super::provider::{ProviderId, ProviderStatus};
use super::request::{RequestId, UserId};
use super::session::SessionId;

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Recipient {
    User(UserId),
    Provider(ProviderId),
}

impl Recipient {
    pub fn kind(&self) -> &'static str {
        match self {
            Recipient::User(_) => "user",
            Recipient::Provider(_) => "provider",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Recipient::User(id) => id.as_str(),
            Recipient::Provider(id) => id.as_str(),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    StatusChanged,
    NewBidReceived,
    BidResult,
    BiddingOpportunity,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::StatusChanged => "status_changed",
            NotificationKind::NewBidReceived => "new_bid_received",
            NotificationKind::BidResult => "bid_result",
            NotificationKind::BiddingOpportunity => "bidding_opportunity",
        }
    }

    /// APNs category used by the mobile clients to route the tap.
    pub fn category(&self) -> &'static str {
        match self {
            NotificationKind::StatusChanged => "STATUS_UPDATE",
            NotificationKind::NewBidReceived => "NEW_QUOTE",
            NotificationKind::BidResult => "BID_RESULT",
            NotificationKind::BiddingOpportunity => "BIDDING_OPPORTUNITY",
        }
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status_changed" => Ok(NotificationKind::StatusChanged),
            "new_bid_received" => Ok(NotificationKind::NewBidReceived),
            "bid_result" => Ok(NotificationKind::BidResult),
            "bidding_opportunity" => Ok(NotificationKind::BiddingOpportunity),
            _ => Err(format!("Invalid notification kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidOutcome {
    Won,
    Lost,
}

/// A platform-neutral notification: title, body and a flat string data map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub request_id: Option<RequestId>,
    pub data: BTreeMap<String, String>,
}

impl Notification {
    fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert("type".to_string(), kind.as_str().to_string());
        Self {
            kind,
            title: title.into(),
            body: body.into(),
            request_id: None,
            data,
        }
    }

    fn for_request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self.data
            .insert("request_id".to_string(), request_id.0.to_string());
        self
    }

    fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn bidding_opportunity(
        request_id: RequestId,
        session_id: SessionId,
        service_category: &str,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self::new(
            NotificationKind::BiddingOpportunity,
            "New Service Request",
            format!("A new {} request is available for bidding", service_category),
        )
        .for_request(request_id)
        .with("session_id", session_id.0.to_string())
        .with("service_category", service_category)
        .with("deadline", deadline.to_rfc3339())
    }

    pub fn new_bid(
        request_id: RequestId,
        bid_id: BidId,
        provider_id: &ProviderId,
        price_quote: f64,
        benchmark: PriceBenchmark,
    ) -> Self {
        Self::new(
            NotificationKind::NewBidReceived,
            "New Quote Received",
            format!("You received a quote of ${:.2}", price_quote),
        )
        .for_request(request_id)
        .with("bid_id", bid_id.0.to_string())
        .with("provider_id", provider_id.as_str())
        .with("price_quote", format!("{:.2}", price_quote))
        .with("price_benchmark", benchmark.as_str())
    }

    pub fn bid_result(request_id: RequestId, bid_id: BidId, outcome: BidOutcome) -> Self {
        let (title, body, result) = match outcome {
            BidOutcome::Won => (
                "Bid Accepted",
                "Congratulations! Your bid was selected. The job is now in your tasks.",
                "won",
            ),
            BidOutcome::Lost => (
                "Bid Update",
                "The customer selected another provider for this request.",
                "lost",
            ),
        };
        Self::new(NotificationKind::BidResult, title, body)
            .for_request(request_id)
            .with("bid_id", bid_id.0.to_string())
            .with("result", result)
    }

    pub fn status_changed(provider_id: &ProviderId, status: ProviderStatus) -> Self {
        let (title, body, action) = match status {
            ProviderStatus::Verified | ProviderStatus::Active => (
                "Account Verified!",
                "Congratulations! You can now start accepting service requests.",
                "verified",
            ),
            _ => (
                "Application Update",
                "Please check your email for details about your application.",
                "rejected",
            ),
        };
        Self::new(NotificationKind::StatusChanged, title, body)
            .with("provider_id", provider_id.as_str())
            .with("status", status.as_str())
            .with("action", action)
    }
}

/// Delivery result reported by a notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeliveryReport {
    /// At least one device received the notification
    pub delivered: bool,
    /// The recipient has no valid device left
    pub recipient_invalid: bool,
    pub sent: usize,
    pub failed: usize,
}

/// Log entry for one dispatched notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub request_id: Option<RequestId>,
    pub delivered: bool,
    pub recipient_invalid: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(
        recipient: Recipient,
        notification: &Notification,
        report: &DeliveryReport,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient,
            kind: notification.kind,
            title: notification.title.clone(),
            body: notification.body.clone(),
            request_id: notification.request_id,
            delivered: report.delivered,
            recipient_invalid: report.recipient_invalid,
            created_at: now,
        }
    }
}
