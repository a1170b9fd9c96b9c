//! Bidding session operations and the request-matched trigger handler.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::bid::BidId;
use crate::domain::notification::{Notification, Recipient};
use crate::domain::provider::ProviderId;
use crate::domain::request::{RequestId, RequestStatus};
use crate::domain::session::{Active, AnySession, BiddingSession, Completed, SessionId};
use crate::error::{GavelError, Result};
use crate::notify::Notifier;
use crate::storage::Storage;

use super::BiddingManager;

/// Input for [`BiddingManager::open_bidding_session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSession {
    pub request_id: RequestId,
    /// Providers to notify; defaults to the request's matched providers.
    #[serde(default)]
    pub provider_ids: Option<BTreeSet<ProviderId>>,
    /// Defaults to now plus the configured session window.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

/// A session as returned by the open operations.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOpened {
    #[serde(flatten)]
    pub session: AnySession,
    /// False when a duplicate trigger found the session already open.
    pub newly_opened: bool,
}

impl<S: Storage + ?Sized, N: Notifier + ?Sized> BiddingManager<S, N> {
    /// Create the active session for a request. Fails with
    /// [`GavelError::DuplicateSession`] if one is already active.
    #[tracing::instrument(skip(self, notified_provider_ids), fields(request_id = %request_id))]
    pub async fn open_session(
        &self,
        request_id: RequestId,
        notified_provider_ids: BTreeSet<ProviderId>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<BiddingSession<Active>> {
        let request = self.storage.get_request(request_id).await?;
        let now = self.storage.now();
        let deadline = match deadline {
            Some(deadline) if deadline <= now => {
                return Err(GavelError::Validation(format!(
                    "deadline {} is not in the future",
                    deadline.to_rfc3339()
                )));
            }
            Some(deadline) => deadline,
            None => now + self.config.session_window(),
        };

        let session = BiddingSession::open(
            request_id,
            request.owner_id,
            notified_provider_ids,
            deadline,
            self.config.max_bids_per_session,
            now,
        );
        self.storage.open_session(&session).await?;

        tracing::info!(
            session_id = %session.data.id,
            deadline = %session.data.deadline,
            notified = session.data.notified_provider_ids.len(),
            "Opened bidding session"
        );
        Ok(session)
    }

    /// Union-append a bid id to an active session.
    pub async fn record_bid(&self, session_id: SessionId, bid_id: BidId) -> Result<()> {
        self.storage.append_session_bid(session_id, bid_id).await
    }

    /// active → completed. Fails with [`GavelError::AlreadyCompleted`] when
    /// called twice.
    #[tracing::instrument(skip(self), fields(session_id = %session_id, bid_id = %selected_bid_id))]
    pub async fn complete_session(
        &self,
        session_id: SessionId,
        selected_bid_id: BidId,
        winning_provider_id: ProviderId,
    ) -> Result<BiddingSession<Completed>> {
        self.storage
            .complete_session(session_id, selected_bid_id, &winning_provider_id)
            .await
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<AnySession> {
        self.storage.get_session(session_id).await
    }

    /// Handle a "request matched" event. Safe to call repeatedly: the
    /// transition is idempotent, only the first call opens a session, and
    /// only a newly opened session fans out bidding-opportunity
    /// notifications.
    #[tracing::instrument(skip(self, provider_ids), fields(request_id = %request_id, providers = provider_ids.len()))]
    pub async fn on_request_matched(
        &self,
        request_id: RequestId,
        provider_ids: BTreeSet<ProviderId>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<SessionOpened> {
        match self
            .transition_to_matched(request_id, provider_ids.clone())
            .await
        {
            Ok(_) => {}
            // A late duplicate after bidding started: report what exists
            Err(e @ GavelError::InvalidTransition(..)) => {
                return match self.latest_session(request_id).await? {
                    Some(session) => Ok(SessionOpened {
                        session,
                        newly_opened: false,
                    }),
                    None => Err(e),
                };
            }
            Err(e) => return Err(e),
        }

        let session = match self.open_session(request_id, provider_ids, deadline).await {
            Ok(session) => session,
            Err(GavelError::DuplicateSession(_)) => {
                tracing::debug!("Session already open, duplicate trigger");
                return match self.storage.find_active_session(request_id).await? {
                    Some(existing) => Ok(SessionOpened {
                        session: existing.into(),
                        newly_opened: false,
                    }),
                    // Completed between the two calls
                    None => self
                        .latest_session(request_id)
                        .await?
                        .map(|session| SessionOpened {
                            session,
                            newly_opened: false,
                        })
                        .ok_or(GavelError::DuplicateSession(request_id)),
                };
            }
            Err(e) => return Err(e),
        };

        self.announce(&session).await;

        Ok(SessionOpened {
            session: session.into(),
            newly_opened: true,
        })
    }

    /// Open a session for a request that is already matched.
    #[tracing::instrument(skip(self, input), fields(request_id = %input.request_id))]
    pub async fn open_bidding_session(&self, input: OpenSession) -> Result<SessionOpened> {
        let request = self.storage.get_request(input.request_id).await?;
        if request.status != RequestStatus::Matched {
            return Err(GavelError::BiddingClosed(request.id, request.status));
        }

        let provider_ids = input
            .provider_ids
            .unwrap_or_else(|| request.matched_provider_ids.clone());
        if provider_ids.is_empty() {
            return Err(GavelError::Validation(
                "a bidding session needs at least one provider".to_string(),
            ));
        }

        let session = self
            .open_session(input.request_id, provider_ids, input.deadline)
            .await?;
        self.announce(&session).await;

        Ok(SessionOpened {
            session: session.into(),
            newly_opened: true,
        })
    }

    /// Tell every notified provider about a newly opened session.
    async fn announce(&self, session: &BiddingSession<Active>) {
        let category = match self.storage.get_request(session.data.request_id).await {
            Ok(request) => request.service_category,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load request for announcement");
                String::new()
            }
        };

        let notifications = session
            .data
            .notified_provider_ids
            .iter()
            .map(|provider_id| {
                (
                    Recipient::Provider(provider_id.clone()),
                    Notification::bidding_opportunity(
                        session.data.request_id,
                        session.data.id,
                        &category,
                        session.data.deadline,
                    ),
                )
            })
            .collect();
        self.dispatch_all(notifications).await;
    }

    async fn latest_session(&self, request_id: RequestId) -> Result<Option<AnySession>> {
        Ok(self.storage.list_sessions(request_id).await?.pop())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::domain::notification::NotificationKind;
    use crate::domain::request::{ServiceRequest, UserId};
    use crate::notify::MockNotifier;
    use crate::storage::InMemoryStorage;

    struct Fixture {
        manager: BiddingManager<InMemoryStorage, MockNotifier>,
        storage: Arc<InMemoryStorage>,
        notifier: Arc<MockNotifier>,
        request_id: RequestId,
    }

    async fn setup() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new().with_fixed_time(Utc::now()));
        let request =
            ServiceRequest::new(UserId::new("owner"), "plumbing", "leaky tap", storage.now());
        storage.create_request(&request).await.unwrap();
        let notifier = Arc::new(MockNotifier::new());
        Fixture {
            manager: BiddingManager::new(storage.clone(), notifier.clone()),
            storage,
            notifier,
            request_id: request.id,
        }
    }

    fn providers() -> BTreeSet<ProviderId> {
        [ProviderId::new("p1"), ProviderId::new("p2")]
            .into_iter()
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn test_trigger_opens_session_and_notifies_each_provider() {
        let f = setup().await;

        let opened = f
            .manager
            .on_request_matched(f.request_id, providers(), None)
            .await
            .unwrap();

        assert!(opened.newly_opened);
        let session = opened.session.as_active().unwrap();
        assert!(session.data.received_bid_ids.is_empty());
        assert_eq!(session.data.max_bids, 10);
        assert_eq!(
            session.data.deadline,
            f.storage.now() + Duration::hours(2)
        );
        assert_eq!(
            f.manager.get_request(f.request_id).await.unwrap().status,
            RequestStatus::Matched
        );

        let calls = f.notifier.get_calls();
        assert_eq!(calls.len(), 2);
        assert!(
            calls
                .iter()
                .all(|c| c.notification.kind == NotificationKind::BiddingOpportunity)
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_duplicate_trigger_is_harmless() {
        let f = setup().await;
        let first = f
            .manager
            .on_request_matched(f.request_id, providers(), None)
            .await
            .unwrap();
        let second = f
            .manager
            .on_request_matched(f.request_id, providers(), None)
            .await
            .unwrap();

        assert!(!second.newly_opened);
        assert_eq!(first.session.id(), second.session.id());
        assert_eq!(f.manager.list_sessions(f.request_id).await.unwrap().len(), 1);
        assert_eq!(f.notifier.call_count(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_second_open_is_a_conflict() {
        let f = setup().await;
        f.manager
            .transition_to_matched(f.request_id, providers())
            .await
            .unwrap();
        f.manager
            .open_bidding_session(OpenSession {
                request_id: f.request_id,
                provider_ids: None,
                deadline: None,
            })
            .await
            .unwrap();

        let err = f
            .manager
            .open_bidding_session(OpenSession {
                request_id: f.request_id,
                provider_ids: None,
                deadline: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GavelError::DuplicateSession(_)));
    }

    #[test_log::test(tokio::test)]
    async fn test_open_requires_matched_request() {
        let f = setup().await;
        let err = f
            .manager
            .open_bidding_session(OpenSession {
                request_id: f.request_id,
                provider_ids: Some(providers()),
                deadline: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GavelError::BiddingClosed(_, RequestStatus::Pending)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_past_deadline_is_rejected() {
        let f = setup().await;
        f.manager
            .transition_to_matched(f.request_id, providers())
            .await
            .unwrap();
        let err = f
            .manager
            .open_session(
                f.request_id,
                providers(),
                Some(f.storage.now() - Duration::minutes(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GavelError::Validation(_)));
    }

    #[test_log::test(tokio::test)]
    async fn test_complete_twice_fails() {
        let f = setup().await;
        let opened = f
            .manager
            .on_request_matched(f.request_id, providers(), None)
            .await
            .unwrap();
        let session_id = opened.session.id();
        let bid_id = BidId(uuid::Uuid::new_v4());

        f.manager
            .complete_session(session_id, bid_id, ProviderId::new("p1"))
            .await
            .unwrap();
        let err = f
            .manager
            .complete_session(session_id, bid_id, ProviderId::new("p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GavelError::AlreadyCompleted(_)));
        assert!(f.manager.get_session(session_id).await.unwrap().is_terminal());
    }

    #[test_log::test(tokio::test)]
    async fn test_record_bid_is_a_union_and_stops_at_completion() {
        let f = setup().await;
        let opened = f
            .manager
            .on_request_matched(f.request_id, providers(), None)
            .await
            .unwrap();
        let session_id = opened.session.id();
        let bid_id = BidId(uuid::Uuid::new_v4());

        f.manager.record_bid(session_id, bid_id).await.unwrap();
        f.manager.record_bid(session_id, bid_id).await.unwrap();
        let session = f.manager.get_session(session_id).await.unwrap();
        assert_eq!(session.data().received_bid_ids, vec![bid_id]);

        f.manager
            .complete_session(session_id, bid_id, ProviderId::new("p1"))
            .await
            .unwrap();
        let err = f
            .manager
            .record_bid(session_id, BidId(uuid::Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, GavelError::AlreadyCompleted(_)));
    }
}
