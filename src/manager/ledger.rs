//! Bid submission.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::bid::{Bid, BidId, BidStatus, PriceBenchmark, SubmitBid, benchmark_price};
use crate::domain::notification::{Notification, Recipient};
use crate::domain::request::{RequestStatus, ServiceRequest};
use crate::domain::session::{Active, BiddingSession, SessionId};
use crate::error::{GavelError, Result};
use crate::notify::Notifier;
use crate::storage::Storage;

use super::BiddingManager;

/// What a provider gets back for a recorded bid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BidReceipt {
    pub bid_id: BidId,
    pub session_id: SessionId,
    pub price_benchmark: PriceBenchmark,
    pub is_ai_generated: bool,
    pub expires_at: DateTime<Utc>,
}

impl<S: Storage + ?Sized, N: Notifier + ?Sized> BiddingManager<S, N> {
    /// Record a provider's bid on a request.
    ///
    /// The first bid on a matched request moves it to bidding. The owner is
    /// notified once the bid is stored.
    #[tracing::instrument(skip(self, input), fields(request_id = %input.request_id, provider_id = %input.provider_id, price_quote = input.price_quote))]
    pub async fn submit_bid(&self, input: SubmitBid) -> Result<BidReceipt> {
        match self.try_submit_bid(input).await {
            Ok(receipt) => {
                counter!(
                    "gavel_bids_submitted_total",
                    "benchmark" => receipt.price_benchmark.as_str()
                )
                .increment(1);
                Ok(receipt)
            }
            Err(e) => {
                counter!("gavel_bids_rejected_total", "reason" => e.kind().as_str()).increment(1);
                tracing::warn!(error = %e, "Bid rejected");
                Err(e)
            }
        }
    }

    async fn try_submit_bid(&self, input: SubmitBid) -> Result<BidReceipt> {
        if !input.price_quote.is_finite() || input.price_quote <= 0.0 {
            return Err(GavelError::Validation(format!(
                "price_quote must be a positive number, got {}",
                input.price_quote
            )));
        }
        if input.provider_id.as_str().trim().is_empty() {
            return Err(GavelError::Validation(
                "provider_id must not be empty".to_string(),
            ));
        }

        let request = self.storage.get_request(input.request_id).await?;
        if !request.status.accepts_bids() {
            return Err(GavelError::BiddingClosed(request.id, request.status));
        }

        let session = self
            .storage
            .find_active_session(request.id)
            .await?
            .ok_or_else(|| {
                GavelError::SessionNotFound(format!(
                    "no active session for request {}",
                    request.id
                ))
            })?;

        let now = self.storage.now();
        if session.is_expired(now) {
            return Err(GavelError::SessionExpired(session.data.id));
        }
        if session.is_full() {
            return Err(GavelError::SessionFull(session.data.id, session.data.max_bids));
        }

        let estimate = input.ai_estimate.or(request.price_estimate);
        let benchmark = benchmark_price(input.price_quote, estimate.as_ref());

        let bid = Bid {
            id: BidId(Uuid::new_v4()),
            request_id: request.id,
            provider_id: input.provider_id,
            owner_id: request.owner_id.clone(),
            price_quote: input.price_quote,
            availability: input.availability,
            message: input.message,
            status: BidStatus::Pending,
            rejection_reason: None,
            created_at: now,
            expires_at: now + self.config.bid_ttl(),
            price_benchmark: benchmark.benchmark,
            is_ai_generated: benchmark.is_ai_generated,
        };

        // The store re-checks status, session and cap together with the
        // insert, so a concurrent accept cannot leave this bid pending.
        if let Err(e) = self.storage.insert_bid(&bid, session.data.id).await {
            if matches!(e, GavelError::DuplicateBid(..)) {
                self.repair_duplicate(&request, &session, &bid).await;
            }
            return Err(e);
        }

        // Counting races between concurrent first bids are harmless: the
        // transition is idempotent, and a request read as matched always
        // takes it.
        let count = self.storage.count_bids(request.id).await?;
        if count == 1 || request.status == RequestStatus::Matched {
            self.transition_to_bidding(request.id).await?;
        }

        tracing::info!(
            bid_id = %bid.id,
            session_id = %session.data.id,
            benchmark = %bid.price_benchmark,
            bid_count = count,
            "Bid recorded"
        );

        self.dispatch(
            Recipient::User(request.owner_id),
            Notification::new_bid(
                request.id,
                bid.id,
                &bid.provider_id,
                bid.price_quote,
                bid.price_benchmark,
            ),
        )
        .await;

        Ok(BidReceipt {
            bid_id: bid.id,
            session_id: session.data.id,
            price_benchmark: bid.price_benchmark,
            is_ai_generated: bid.is_ai_generated,
            expires_at: bid.expires_at,
        })
    }

    /// A retried submission whose first attempt stored the bid but failed
    /// before finishing the bookkeeping: finish it for the existing bid.
    async fn repair_duplicate(
        &self,
        request: &ServiceRequest,
        session: &BiddingSession<Active>,
        attempted: &Bid,
    ) {
        let existing = match self.storage.list_bids(request.id).await {
            Ok(bids) => bids
                .into_iter()
                .find(|b| b.provider_id == attempted.provider_id && b.is_pending()),
            Err(e) => {
                tracing::warn!(error = %e, "Could not load bids to repair duplicate");
                return;
            }
        };
        let Some(existing) = existing else {
            return;
        };

        if let Err(e) = self.transition_to_bidding(request.id).await {
            tracing::warn!(error = %e, "Could not move request to bidding during repair");
        }
        if let Err(e) = self.record_bid(session.data.id, existing.id).await {
            tracing::warn!(
                error = %e,
                bid_id = %existing.id,
                "Could not record existing bid on session"
            );
        }
    }
}
