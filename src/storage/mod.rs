//! Storage traits for the bidding system.
//!
//! [`Storage`] is the document-store contract the state machine depends on:
//! get-by-id, compare-and-set status updates, union appends, filtered queries
//! by request, and one all-or-nothing [`Resolution`] batch. Every conditional
//! write is atomic in the backend; the manager never holds a lock of its own
//! across store calls.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::bid::{Bid, BidId};
use crate::domain::notification::{NotificationRecord, Recipient};
use crate::domain::provider::{Provider, ProviderId, ProviderStatus, ProviderStatusChange};
use crate::domain::request::{RequestId, RequestMutation, RequestStatus, ServiceRequest};
use crate::domain::session::{Active, AnySession, BiddingSession, Completed, SessionId};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;

/// One document mutation inside a [`Resolution`], with its precondition.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionStep {
    /// pending → accepted
    AcceptBid { bid_id: BidId },
    /// pending → rejected, stamping the reason
    RejectBid { bid_id: BidId, reason: String },
    /// active → completed
    CompleteSession {
        session_id: SessionId,
        selected_bid_id: BidId,
        winning_provider_id: ProviderId,
    },
    /// `expected` → assigned
    AssignRequest {
        request_id: RequestId,
        expected: RequestStatus,
        provider_id: ProviderId,
        bid_id: BidId,
    },
}

/// The accept-bid fan-out as a single batch. Backends must apply either
/// every step or none; a step whose precondition fails aborts the whole
/// batch with [`GavelError::StaleResolution`](crate::GavelError::StaleResolution).
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub request_id: RequestId,
    pub steps: Vec<ResolutionStep>,
    pub at: DateTime<Utc>,
}

impl Resolution {
    /// Bids the batch accepts or rejects. Backends refuse the batch when the
    /// request holds a pending bid outside this set.
    pub fn bid_ids(&self) -> BTreeSet<BidId> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                ResolutionStep::AcceptBid { bid_id } | ResolutionStep::RejectBid { bid_id, .. } => {
                    Some(*bid_id)
                }
                _ => None,
            })
            .collect()
    }
}

/// Device tokens per recipient, used by the push notifier.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Register a token; registering the same token twice is a no-op.
    async fn register_device_token(&self, recipient: &Recipient, token: &str) -> Result<()>;

    async fn device_tokens(&self, recipient: &Recipient) -> Result<Vec<String>>;

    /// Remove tokens the push service reported as invalid. Returns how many
    /// were removed.
    async fn remove_device_tokens(&self, recipient: &Recipient, tokens: &[String])
    -> Result<usize>;
}

/// Storage trait for requests, sessions, bids, providers and the
/// notification log.
#[async_trait]
pub trait Storage: DeviceRegistry + Send + Sync {
    /// Server timestamp. All `created_at`/`deadline` arithmetic uses this
    /// clock, never the caller's.
    fn now(&self) -> DateTime<Utc>;

    // Requests

    /// Insert a request. Used by the external matching process.
    async fn create_request(&self, request: &ServiceRequest) -> Result<()>;

    async fn get_request(&self, id: RequestId) -> Result<ServiceRequest>;

    /// Compare-and-set: apply `mutation` only if the request is still in
    /// `expected`. Returns `false` when the status had moved on.
    async fn transition_request(
        &self,
        id: RequestId,
        expected: RequestStatus,
        mutation: &RequestMutation,
    ) -> Result<bool>;

    // Sessions

    /// Atomically check that no active session exists for the request and
    /// create this one. Fails with `DuplicateSession` otherwise.
    async fn open_session(&self, session: &BiddingSession<Active>) -> Result<()>;

    async fn get_session(&self, id: SessionId) -> Result<AnySession>;

    async fn find_active_session(
        &self,
        request_id: RequestId,
    ) -> Result<Option<BiddingSession<Active>>>;

    /// Every session ever opened for the request, oldest first.
    async fn list_sessions(&self, request_id: RequestId) -> Result<Vec<AnySession>>;

    /// Union-append a bid id to the session's received list.
    async fn append_session_bid(&self, session_id: SessionId, bid_id: BidId) -> Result<()>;

    /// active → completed. Fails with `AlreadyCompleted` if the session is
    /// not active anymore.
    async fn complete_session(
        &self,
        session_id: SessionId,
        selected_bid_id: BidId,
        winning_provider_id: &ProviderId,
    ) -> Result<BiddingSession<Completed>>;

    // Bids

    /// Insert a bid into the request's active session and append it to the
    /// session's received list. Checked atomically with the write:
    /// - the request still accepts bids (`BiddingClosed`)
    /// - `session_id` is the active session of the request
    ///   (`AlreadyCompleted`, `SessionNotFound`)
    /// - the session is below its cap (`SessionFull`)
    /// - the provider has no pending bid on the request (`DuplicateBid`)
    async fn insert_bid(&self, bid: &Bid, session_id: SessionId) -> Result<()>;

    async fn get_bid(&self, id: BidId) -> Result<Bid>;

    /// All bids for a request, ordered by creation time.
    async fn list_bids(&self, request_id: RequestId) -> Result<Vec<Bid>>;

    async fn count_bids(&self, request_id: RequestId) -> Result<usize>;

    /// Apply an accept-bid resolution atomically. Fails with
    /// `StaleResolution` if a step's precondition no longer holds or a bid
    /// landed that the batch does not resolve.
    async fn apply_resolution(&self, resolution: &Resolution) -> Result<()>;

    // Providers

    async fn create_provider(&self, provider: &Provider) -> Result<()>;

    async fn get_provider(&self, id: &ProviderId) -> Result<Provider>;

    /// Compare-and-set on the provider status. Returns `false` when the
    /// provider is no longer in `change.expected`.
    async fn update_provider_status(
        &self,
        id: &ProviderId,
        change: &ProviderStatusChange,
    ) -> Result<bool>;

    async fn list_providers(&self, status: Option<ProviderStatus>) -> Result<Vec<Provider>>;

    // Notification log

    async fn record_notification(&self, record: &NotificationRecord) -> Result<()>;

    async fn list_notifications(&self, recipient: &Recipient) -> Result<Vec<NotificationRecord>>;
}
