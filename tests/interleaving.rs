//! Bid submission and acceptance interleaved at their worst points.
//!
//! `Interleaved` delegates to an in-memory store but runs one operation of a
//! second manager right before a chosen write, the way a concurrent caller
//! on another instance would.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gavel::domain::notification::NotificationRecord;
use gavel::domain::provider::ProviderStatusChange;
use gavel::domain::request::RequestMutation;
use gavel::storage::Resolution;
use gavel::{
    AcceptOutcome, Active, AnySession, Bid, BidId, BidReceipt, BidStatus, BiddingManager,
    BiddingSession, Completed, DeviceRegistry, GavelError, InMemoryStorage, MockNotifier,
    Provider, ProviderId, ProviderStatus, Recipient, RequestId, RequestStatus, Result,
    ServiceRequest, SessionId, Storage, SubmitBid, UserId,
};
use parking_lot::Mutex;

enum Interleave {
    AcceptBeforeInsert(BidId),
    SubmitBeforeResolution(SubmitBid),
}

struct Interleaved {
    inner: Arc<InMemoryStorage>,
    other: BiddingManager<InMemoryStorage, MockNotifier>,
    next: Mutex<Option<Interleave>>,
    accepted: Mutex<Option<Result<AcceptOutcome>>>,
    submitted: Mutex<Option<Result<BidReceipt>>>,
}

impl Interleaved {
    fn new(inner: Arc<InMemoryStorage>) -> Self {
        Self {
            other: BiddingManager::new(inner.clone(), Arc::new(MockNotifier::new())),
            inner,
            next: Mutex::new(None),
            accepted: Mutex::new(None),
            submitted: Mutex::new(None),
        }
    }

    fn schedule(&self, action: Interleave) {
        *self.next.lock() = Some(action);
    }
}

#[async_trait]
impl DeviceRegistry for Interleaved {
    async fn register_device_token(&self, recipient: &Recipient, token: &str) -> Result<()> {
        self.inner.register_device_token(recipient, token).await
    }

    async fn device_tokens(&self, recipient: &Recipient) -> Result<Vec<String>> {
        self.inner.device_tokens(recipient).await
    }

    async fn remove_device_tokens(
        &self,
        recipient: &Recipient,
        tokens: &[String],
    ) -> Result<usize> {
        self.inner.remove_device_tokens(recipient, tokens).await
    }
}

#[async_trait]
impl Storage for Interleaved {
    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }

    async fn create_request(&self, request: &ServiceRequest) -> Result<()> {
        self.inner.create_request(request).await
    }

    async fn get_request(&self, id: RequestId) -> Result<ServiceRequest> {
        self.inner.get_request(id).await
    }

    async fn transition_request(
        &self,
        id: RequestId,
        expected: RequestStatus,
        mutation: &RequestMutation,
    ) -> Result<bool> {
        self.inner.transition_request(id, expected, mutation).await
    }

    async fn open_session(&self, session: &BiddingSession<Active>) -> Result<()> {
        self.inner.open_session(session).await
    }

    async fn get_session(&self, id: SessionId) -> Result<AnySession> {
        self.inner.get_session(id).await
    }

    async fn find_active_session(
        &self,
        request_id: RequestId,
    ) -> Result<Option<BiddingSession<Active>>> {
        self.inner.find_active_session(request_id).await
    }

    async fn list_sessions(&self, request_id: RequestId) -> Result<Vec<AnySession>> {
        self.inner.list_sessions(request_id).await
    }

    async fn append_session_bid(&self, session_id: SessionId, bid_id: BidId) -> Result<()> {
        self.inner.append_session_bid(session_id, bid_id).await
    }

    async fn complete_session(
        &self,
        session_id: SessionId,
        selected_bid_id: BidId,
        winning_provider_id: &ProviderId,
    ) -> Result<BiddingSession<Completed>> {
        self.inner
            .complete_session(session_id, selected_bid_id, winning_provider_id)
            .await
    }

    async fn insert_bid(&self, bid: &Bid, session_id: SessionId) -> Result<()> {
        let action = self
            .next
            .lock()
            .take_if(|a| matches!(a, Interleave::AcceptBeforeInsert(_)));
        if let Some(Interleave::AcceptBeforeInsert(bid_id)) = action {
            let result = self.other.accept_bid(bid_id, &UserId::new("owner-1")).await;
            *self.accepted.lock() = Some(result);
        }
        self.inner.insert_bid(bid, session_id).await
    }

    async fn get_bid(&self, id: BidId) -> Result<Bid> {
        self.inner.get_bid(id).await
    }

    async fn list_bids(&self, request_id: RequestId) -> Result<Vec<Bid>> {
        self.inner.list_bids(request_id).await
    }

    async fn count_bids(&self, request_id: RequestId) -> Result<usize> {
        self.inner.count_bids(request_id).await
    }

    async fn apply_resolution(&self, resolution: &Resolution) -> Result<()> {
        let action = self
            .next
            .lock()
            .take_if(|a| matches!(a, Interleave::SubmitBeforeResolution(_)));
        if let Some(Interleave::SubmitBeforeResolution(input)) = action {
            let result = self.other.submit_bid(input).await;
            *self.submitted.lock() = Some(result);
        }
        self.inner.apply_resolution(resolution).await
    }

    async fn create_provider(&self, provider: &Provider) -> Result<()> {
        self.inner.create_provider(provider).await
    }

    async fn get_provider(&self, id: &ProviderId) -> Result<Provider> {
        self.inner.get_provider(id).await
    }

    async fn update_provider_status(
        &self,
        id: &ProviderId,
        change: &ProviderStatusChange,
    ) -> Result<bool> {
        self.inner.update_provider_status(id, change).await
    }

    async fn list_providers(&self, status: Option<ProviderStatus>) -> Result<Vec<Provider>> {
        self.inner.list_providers(status).await
    }

    async fn record_notification(&self, record: &NotificationRecord) -> Result<()> {
        self.inner.record_notification(record).await
    }

    async fn list_notifications(&self, recipient: &Recipient) -> Result<Vec<NotificationRecord>> {
        self.inner.list_notifications(recipient).await
    }
}

struct Fixture {
    manager: BiddingManager<Interleaved, MockNotifier>,
    storage: Arc<Interleaved>,
    notifier: Arc<MockNotifier>,
    request_id: RequestId,
}

async fn setup() -> Fixture {
    let inner = Arc::new(InMemoryStorage::new().with_fixed_time(Utc::now()));
    let storage = Arc::new(Interleaved::new(inner));
    let notifier = Arc::new(MockNotifier::new());
    let manager = BiddingManager::new(storage.clone(), notifier.clone());

    let request = ServiceRequest::new(UserId::new("owner-1"), "gardening", "", storage.now());
    storage.create_request(&request).await.unwrap();
    let providers: BTreeSet<ProviderId> = ["P1", "P2"].into_iter().map(ProviderId::new).collect();
    manager
        .on_request_matched(request.id, providers, None)
        .await
        .unwrap();

    Fixture {
        manager,
        storage,
        notifier,
        request_id: request.id,
    }
}

fn bid(request_id: RequestId, provider: &str, price: f64) -> SubmitBid {
    SubmitBid {
        request_id,
        provider_id: ProviderId::new(provider),
        price_quote: price,
        availability: String::new(),
        message: String::new(),
        ai_estimate: None,
    }
}

#[test_log::test(tokio::test)]
async fn test_accept_between_bid_checks_and_insert() {
    let f = setup().await;
    let b1 = f
        .manager
        .submit_bid(bid(f.request_id, "P1", 40.0))
        .await
        .unwrap();

    f.storage.schedule(Interleave::AcceptBeforeInsert(b1.bid_id));
    let err = f
        .manager
        .submit_bid(bid(f.request_id, "P2", 35.0))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GavelError::BiddingClosed(_, RequestStatus::Assigned)
    ));
    let accepted = f.storage.accepted.lock().take().unwrap().unwrap();
    assert_eq!(accepted.accepted_bid_id, b1.bid_id);

    // The refused bid left nothing behind
    let bids = f.storage.list_bids(f.request_id).await.unwrap();
    assert_eq!(bids.len(), 1);
    assert_eq!(bids[0].status, BidStatus::Accepted);
    let session = f.storage.get_session(b1.session_id).await.unwrap();
    assert_eq!(session.data().received_bid_ids, vec![b1.bid_id]);
    assert_eq!(
        f.storage.get_request(f.request_id).await.unwrap().status,
        RequestStatus::Assigned
    );
}

#[test_log::test(tokio::test)]
async fn test_bid_landing_before_resolution_is_rejected_too() {
    let f = setup().await;
    let b1 = f
        .manager
        .submit_bid(bid(f.request_id, "P1", 40.0))
        .await
        .unwrap();
    f.notifier.clear_calls();

    f.storage
        .schedule(Interleave::SubmitBeforeResolution(bid(f.request_id, "P2", 35.0)));
    let outcome = f
        .manager
        .accept_bid(b1.bid_id, &UserId::new("owner-1"))
        .await
        .unwrap();

    let late = f.storage.submitted.lock().take().unwrap().unwrap();
    assert!(!outcome.already_resolved);
    assert_eq!(outcome.rejected_bid_ids, vec![late.bid_id]);

    let bids = f.storage.list_bids(f.request_id).await.unwrap();
    assert!(bids.iter().all(|b| !b.is_pending()));
    assert_eq!(
        f.storage.get_bid(late.bid_id).await.unwrap().status,
        BidStatus::Rejected
    );

    let p2 = f
        .notifier
        .calls_for(&Recipient::Provider(ProviderId::new("P2")));
    assert_eq!(p2.len(), 1);
    assert_eq!(p2[0].data["result"], "lost");
}
