//! Request status transitions.

use std::collections::BTreeSet;

use crate::domain::bid::BidId;
use crate::domain::provider::ProviderId;
use crate::domain::request::{RequestId, RequestMutation, TransitionOutcome, TransitionPlan};
use crate::error::{GavelError, Result};
use crate::notify::Notifier;
use crate::storage::Storage;

use super::BiddingManager;

/// Status only moves forward through four values, so a compare-and-set can
/// lose at most this many races before the plan settles.
const MAX_TRANSITION_ATTEMPTS: usize = 4;

impl<S: Storage + ?Sized, N: Notifier + ?Sized> BiddingManager<S, N> {
    /// pending → matched, recording the matched providers.
    #[tracing::instrument(skip(self, provider_ids), fields(request_id = %request_id, providers = provider_ids.len()))]
    pub async fn transition_to_matched(
        &self,
        request_id: RequestId,
        provider_ids: BTreeSet<ProviderId>,
    ) -> Result<TransitionOutcome> {
        if provider_ids.is_empty() {
            return Err(GavelError::Validation(
                "matched_provider_ids must not be empty".to_string(),
            ));
        }
        self.transition(request_id, RequestMutation::Match { provider_ids })
            .await
    }

    /// matched → bidding. Called on the first recorded bid.
    #[tracing::instrument(skip(self), fields(request_id = %request_id))]
    pub async fn transition_to_bidding(&self, request_id: RequestId) -> Result<TransitionOutcome> {
        self.transition(request_id, RequestMutation::StartBidding)
            .await
    }

    /// matched|bidding → assigned. Re-assigning to the same bid is a no-op;
    /// a request assigned to a different bid never changes hands.
    #[tracing::instrument(skip(self), fields(request_id = %request_id, provider_id = %provider_id, bid_id = %bid_id))]
    pub async fn transition_to_assigned(
        &self,
        request_id: RequestId,
        provider_id: ProviderId,
        bid_id: BidId,
    ) -> Result<TransitionOutcome> {
        self.transition(
            request_id,
            RequestMutation::Assign {
                provider_id,
                bid_id,
            },
        )
        .await
    }

    /// Plan against the current status, then compare-and-set. A lost race
    /// re-reads and re-plans.
    async fn transition(
        &self,
        request_id: RequestId,
        mutation: RequestMutation,
    ) -> Result<TransitionOutcome> {
        let target = mutation.target();

        for attempt in 1..=MAX_TRANSITION_ATTEMPTS {
            let request = self.storage.get_request(request_id).await?;

            match request.status.plan(&mutation) {
                TransitionPlan::Unchanged => {
                    if let RequestMutation::Assign { bid_id, .. } = &mutation
                        && request.selected_bid_id != Some(*bid_id)
                    {
                        return Err(GavelError::InvalidTransition(
                            request_id,
                            request.status,
                            target,
                        ));
                    }
                    tracing::debug!(status = %request.status, "Transition already applied");
                    return Ok(TransitionOutcome::Unchanged);
                }
                TransitionPlan::Invalid => {
                    tracing::warn!(
                        from = %request.status,
                        to = %target,
                        "Rejected invalid request transition"
                    );
                    return Err(GavelError::InvalidTransition(
                        request_id,
                        request.status,
                        target,
                    ));
                }
                TransitionPlan::Apply => {
                    if self
                        .storage
                        .transition_request(request_id, request.status, &mutation)
                        .await?
                    {
                        tracing::info!(
                            from = %request.status,
                            to = %target,
                            "Request transitioned"
                        );
                        return Ok(TransitionOutcome::Applied);
                    }
                    tracing::debug!(attempt, "Request status changed concurrently, re-planning");
                }
            }
        }

        Err(GavelError::Store(format!(
            "request {} kept changing during transition to {}",
            request_id, target
        )))
    }
}
