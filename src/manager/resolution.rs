//! Bid acceptance.
//!
//! Accepting a bid touches every document of the request at once: the bid,
//! its pending siblings, the active session and the request itself. The
//! whole fan-out goes to the store as one [`Resolution`] so that concurrent
//! accepts cannot both succeed.

use std::collections::BTreeSet;

use metrics::counter;
use serde::Serialize;

use crate::domain::bid::{Bid, BidId, BidStatus};
use crate::domain::notification::{BidOutcome, Notification, Recipient};
use crate::domain::provider::ProviderId;
use crate::domain::request::{RequestId, RequestStatus, UserId};
use crate::error::{GavelError, Result};
use crate::notify::Notifier;
use crate::storage::{Resolution, ResolutionStep, Storage};

use super::BiddingManager;

/// A stale batch is re-planned from a fresh read. It goes stale when another
/// accept commits, which the re-read then reports, or when a bid lands
/// between the read and the commit, which the next plan rejects.
const MAX_RESOLUTION_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptOutcome {
    pub request_id: RequestId,
    pub accepted_bid_id: BidId,
    pub winning_provider_id: ProviderId,
    pub rejected_bid_ids: Vec<BidId>,
    /// True when the request had already been resolved before this call.
    pub already_resolved: bool,
}

impl AcceptOutcome {
    fn existing(request_id: RequestId, accepted: &Bid, bids: &[Bid]) -> Self {
        Self {
            request_id,
            accepted_bid_id: accepted.id,
            winning_provider_id: accepted.provider_id.clone(),
            rejected_bid_ids: bids
                .iter()
                .filter(|b| b.status == BidStatus::Rejected)
                .map(|b| b.id)
                .collect(),
            already_resolved: true,
        }
    }
}

impl<S: Storage + ?Sized, N: Notifier + ?Sized> BiddingManager<S, N> {
    /// Accept `bid_id` on behalf of the request owner.
    ///
    /// Idempotent: accepting again, or accepting after another bid won,
    /// returns the committed outcome with `already_resolved` set and sends
    /// nothing.
    #[tracing::instrument(skip(self), fields(bid_id = %bid_id, owner_id = %requesting_owner_id))]
    pub async fn accept_bid(
        &self,
        bid_id: BidId,
        requesting_owner_id: &UserId,
    ) -> Result<AcceptOutcome> {
        let request_id = self.storage.get_bid(bid_id).await?.request_id;

        let owner_id = self.storage.get_request(request_id).await?.owner_id;
        if &owner_id != requesting_owner_id {
            tracing::warn!(request_id = %request_id, "Accept attempted by non-owner");
            return Err(GavelError::Unauthorized(format!(
                "user {} does not own request {}",
                requesting_owner_id, request_id
            )));
        }

        let mut last_error = None;
        for attempt in 1..=MAX_RESOLUTION_ATTEMPTS {
            let request = self.storage.get_request(request_id).await?;
            let bids = self.storage.list_bids(request_id).await?;

            if let Some(accepted) = bids.iter().find(|b| b.status == BidStatus::Accepted) {
                tracing::info!(
                    request_id = %request_id,
                    accepted_bid_id = %accepted.id,
                    "Request already resolved"
                );
                return Ok(AcceptOutcome::existing(request_id, accepted, &bids));
            }

            let Some(target) = bids.iter().find(|b| b.id == bid_id) else {
                return Err(GavelError::BidNotFound(bid_id));
            };
            if !target.is_pending() {
                return Err(GavelError::StaleResolution(
                    request_id,
                    format!("bid {} is {} but no bid was accepted", bid_id, target.status),
                ));
            }
            if !matches!(request.status, RequestStatus::Matched | RequestStatus::Bidding) {
                return Err(GavelError::InvalidTransition(
                    request_id,
                    request.status,
                    RequestStatus::Assigned,
                ));
            }

            let session = self.storage.find_active_session(request_id).await?;
            let losers: Vec<&Bid> = bids
                .iter()
                .filter(|b| b.id != bid_id && b.is_pending())
                .collect();

            let mut steps = vec![ResolutionStep::AcceptBid { bid_id }];
            steps.extend(losers.iter().map(|b| ResolutionStep::RejectBid {
                bid_id: b.id,
                reason: self.config.rejection_reason.clone(),
            }));
            if let Some(session) = &session {
                steps.push(ResolutionStep::CompleteSession {
                    session_id: session.data.id,
                    selected_bid_id: bid_id,
                    winning_provider_id: target.provider_id.clone(),
                });
            }
            steps.push(ResolutionStep::AssignRequest {
                request_id,
                expected: request.status,
                provider_id: target.provider_id.clone(),
                bid_id,
            });

            let resolution = Resolution {
                request_id,
                steps,
                at: self.storage.now(),
            };

            match self.storage.apply_resolution(&resolution).await {
                Ok(()) => {
                    counter!("gavel_resolutions_total").increment(1);
                    tracing::info!(
                        request_id = %request_id,
                        winner = %target.provider_id,
                        rejected = losers.len(),
                        session_completed = session.is_some(),
                        "Bid accepted"
                    );

                    let outcome = AcceptOutcome {
                        request_id,
                        accepted_bid_id: bid_id,
                        winning_provider_id: target.provider_id.clone(),
                        rejected_bid_ids: losers.iter().map(|b| b.id).collect(),
                        already_resolved: false,
                    };
                    self.announce_result(&outcome, &losers).await;
                    return Ok(outcome);
                }
                Err(e @ GavelError::StaleResolution(..)) => {
                    tracing::debug!(attempt, error = %e, "Resolution lost a race, re-reading");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        // Retries exhausted without anyone winning: surface the conflict.
        Err(last_error.unwrap_or_else(|| {
            GavelError::StaleResolution(request_id, "resolution did not settle".to_string())
        }))
    }

    /// Winner hears "won", every other bidding provider hears "lost" once.
    async fn announce_result(&self, outcome: &AcceptOutcome, losers: &[&Bid]) {
        let mut notifications = vec![(
            Recipient::Provider(outcome.winning_provider_id.clone()),
            Notification::bid_result(outcome.request_id, outcome.accepted_bid_id, BidOutcome::Won),
        )];

        let mut seen = BTreeSet::new();
        for bid in losers {
            if bid.provider_id == outcome.winning_provider_id || !seen.insert(&bid.provider_id) {
                continue;
            }
            notifications.push((
                Recipient::Provider(bid.provider_id.clone()),
                Notification::bid_result(outcome.request_id, bid.id, BidOutcome::Lost),
            ));
        }

        self.dispatch_all(notifications).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::bid::SubmitBid;
    use crate::domain::notification::NotificationKind;
    use crate::domain::request::ServiceRequest;
    use crate::domain::session::SessionStatus;
    use crate::notify::MockNotifier;
    use crate::storage::InMemoryStorage;

    struct Fixture {
        manager: BiddingManager<InMemoryStorage, MockNotifier>,
        storage: Arc<InMemoryStorage>,
        notifier: Arc<MockNotifier>,
        request_id: RequestId,
        bids: Vec<BidId>,
    }

    fn owner() -> UserId {
        UserId::new("owner")
    }

    async fn setup(providers: &[&str]) -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let request = ServiceRequest::new(owner(), "gardening", "hedge trim", storage.now());
        storage.create_request(&request).await.unwrap();
        let notifier = Arc::new(MockNotifier::new());
        let manager = BiddingManager::new(storage.clone(), notifier.clone());

        manager
            .on_request_matched(
                request.id,
                providers.iter().map(|p| ProviderId::new(*p)).collect(),
                None,
            )
            .await
            .unwrap();

        let mut bids = Vec::new();
        for (i, provider) in providers.iter().enumerate() {
            let receipt = manager
                .submit_bid(SubmitBid {
                    request_id: request.id,
                    provider_id: ProviderId::new(*provider),
                    price_quote: 100.0 + i as f64 * 10.0,
                    availability: String::new(),
                    message: String::new(),
                    ai_estimate: None,
                })
                .await
                .unwrap();
            bids.push(receipt.bid_id);
        }
        notifier.clear_calls();

        Fixture {
            manager,
            storage,
            notifier,
            request_id: request.id,
            bids,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_accept_resolves_everything() {
        let f = setup(&["p1", "p2", "p3"]).await;

        let outcome = f.manager.accept_bid(f.bids[1], &owner()).await.unwrap();

        assert!(!outcome.already_resolved);
        assert_eq!(outcome.winning_provider_id, ProviderId::new("p2"));
        assert_eq!(outcome.rejected_bid_ids.len(), 2);

        let bids = f.storage.list_bids(f.request_id).await.unwrap();
        let accepted: Vec<_> = bids.iter().filter(|b| b.status == BidStatus::Accepted).collect();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].id, f.bids[1]);
        for bid in bids.iter().filter(|b| b.id != f.bids[1]) {
            assert_eq!(bid.status, BidStatus::Rejected);
            assert_eq!(bid.rejection_reason.as_deref(), Some("another bid selected"));
        }

        let request = f.storage.get_request(f.request_id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Assigned);
        assert_eq!(request.selected_bid_id, Some(f.bids[1]));

        let sessions = f.manager.list_sessions(f.request_id).await.unwrap();
        assert_eq!(sessions[0].status(), SessionStatus::Completed);
    }

    #[test_log::test(tokio::test)]
    async fn test_winner_and_losers_notified_once() {
        let f = setup(&["p1", "p2", "p3"]).await;
        f.manager.accept_bid(f.bids[0], &owner()).await.unwrap();

        let won = f.notifier.calls_for(&Recipient::Provider(ProviderId::new("p1")));
        assert_eq!(won.len(), 1);
        assert_eq!(won[0].kind, NotificationKind::BidResult);
        assert_eq!(won[0].data["result"], "won");

        for loser in ["p2", "p3"] {
            let lost = f.notifier.calls_for(&Recipient::Provider(ProviderId::new(loser)));
            assert_eq!(lost.len(), 1);
            assert_eq!(lost[0].data["result"], "lost");
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_accept_is_idempotent() {
        let f = setup(&["p1", "p2"]).await;
        f.manager.accept_bid(f.bids[0], &owner()).await.unwrap();
        let calls = f.notifier.call_count();

        let again = f.manager.accept_bid(f.bids[0], &owner()).await.unwrap();
        assert!(again.already_resolved);
        assert_eq!(again.accepted_bid_id, f.bids[0]);

        // A different bid after resolution reports the committed winner
        let other = f.manager.accept_bid(f.bids[1], &owner()).await.unwrap();
        assert!(other.already_resolved);
        assert_eq!(other.accepted_bid_id, f.bids[0]);

        assert_eq!(f.notifier.call_count(), calls);
    }

    #[test_log::test(tokio::test)]
    async fn test_non_owner_cannot_accept() {
        let f = setup(&["p1", "p2"]).await;

        let err = f
            .manager
            .accept_bid(f.bids[0], &UserId::new("intruder"))
            .await
            .unwrap_err();

        assert!(matches!(err, GavelError::Unauthorized(_)));
        assert!(
            f.storage
                .list_bids(f.request_id)
                .await
                .unwrap()
                .iter()
                .all(Bid::is_pending)
        );
        assert_eq!(
            f.storage.get_request(f.request_id).await.unwrap().status,
            RequestStatus::Bidding
        );
        assert_eq!(f.notifier.call_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_accepts_pick_one_winner() {
        let f = setup(&["p1", "p2", "p3"]).await;

        let (owner_a, owner_b) = (owner(), owner());
        let (a, b) = tokio::join!(
            f.manager.accept_bid(f.bids[0], &owner_a),
            f.manager.accept_bid(f.bids[2], &owner_b),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.accepted_bid_id, b.accepted_bid_id);
        assert!(a.already_resolved != b.already_resolved);

        let accepted = f
            .storage
            .list_bids(f.request_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|bid| bid.status == BidStatus::Accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_bid() {
        let f = setup(&["p1"]).await;
        let err = f
            .manager
            .accept_bid(BidId(uuid::Uuid::new_v4()), &owner())
            .await
            .unwrap_err();
        assert!(matches!(err, GavelError::BidNotFound(_)));
    }
}
