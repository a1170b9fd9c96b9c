use std::collections::BTreeSet;
use std::sync::Arc;

use gavel::domain::notification::DeliveryReport;
use gavel::push::PushMessage;
use gavel::{
    BiddingManager, DeviceRegistry, FcmNotifier, InMemoryStorage, MockPushTransport, Notifier,
    NotificationKind, Provider, ProviderId, ProviderStatus, PushResponse, Recipient,
    ServiceRequest, Storage, SubmitBid, UserId,
};

type PushNotifier = FcmNotifier<MockPushTransport, InMemoryStorage>;

fn setup() -> (
    BiddingManager<InMemoryStorage, PushNotifier>,
    Arc<InMemoryStorage>,
    MockPushTransport,
) {
    let storage = Arc::new(InMemoryStorage::new());
    let transport = MockPushTransport::new();
    let notifier = Arc::new(FcmNotifier::new(transport.clone(), storage.clone()));
    (
        BiddingManager::new(storage.clone(), notifier),
        storage,
        transport,
    )
}

fn provider(id: &str) -> Recipient {
    Recipient::Provider(ProviderId::new(id))
}

fn sent_to(transport: &MockPushTransport, token: &str) -> Vec<PushMessage> {
    transport
        .get_calls()
        .into_iter()
        .filter(|m| m.token == token)
        .collect()
}

#[test_log::test(tokio::test)]
async fn test_push_delivery_through_the_bidding_flow() {
    let (manager, storage, transport) = setup();
    let owner = Recipient::User(UserId::new("owner-1"));
    manager
        .register_device_token(&owner, "owner-phone")
        .await
        .unwrap();
    manager
        .register_device_token(&provider("P1"), "p1-old")
        .await
        .unwrap();
    manager
        .register_device_token(&provider("P1"), "p1-new")
        .await
        .unwrap();
    transport.add_response("p1-old", Ok(PushResponse::unregistered()));

    let request = ServiceRequest::new(UserId::new("owner-1"), "plumbing", "", storage.now());
    storage.create_request(&request).await.unwrap();
    let providers: BTreeSet<_> = ["P1", "P2"].into_iter().map(ProviderId::new).collect();
    manager
        .on_request_matched(request.id, providers, None)
        .await
        .unwrap();

    // The stale token was tried once and pruned
    assert_eq!(sent_to(&transport, "p1-old").len(), 1);
    assert_eq!(
        storage.device_tokens(&provider("P1")).await.unwrap(),
        vec!["p1-new"]
    );

    // P2 has no devices: logged as undeliverable, not an error
    let p2_log = storage.list_notifications(&provider("P2")).await.unwrap();
    assert_eq!(p2_log.len(), 1);
    assert!(!p2_log[0].delivered);
    assert!(p2_log[0].recipient_invalid);

    let receipt = manager
        .submit_bid(SubmitBid {
            request_id: request.id,
            provider_id: ProviderId::new("P1"),
            price_quote: 180.0,
            availability: "Tomorrow morning".to_string(),
            message: "Licensed plumber".to_string(),
            ai_estimate: None,
        })
        .await
        .unwrap();

    let owner_pushes = sent_to(&transport, "owner-phone");
    assert_eq!(owner_pushes.len(), 1);
    let body = owner_pushes[0].to_json();
    assert_eq!(body["message"]["data"]["type"], "new_bid_received");
    assert_eq!(body["message"]["data"]["price_quote"], "180.00");
    assert_eq!(body["message"]["data"]["price_benchmark"], "normal");

    manager
        .accept_bid(receipt.bid_id, &UserId::new("owner-1"))
        .await
        .unwrap();

    let p1_pushes = sent_to(&transport, "p1-new");
    assert_eq!(p1_pushes.len(), 2);
    assert_eq!(p1_pushes[1].notification.kind, NotificationKind::BidResult);
    assert_eq!(p1_pushes[1].notification.data["result"], "won");
    assert_eq!(sent_to(&transport, "p1-old").len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_provider_review_pushes_outcome_once() {
    let (manager, storage, transport) = setup();
    manager
        .register_provider(Provider::new(ProviderId::new("P9"), "Spotless Ltd"))
        .await
        .unwrap();
    manager
        .register_device_token(&provider("P9"), "p9-tablet")
        .await
        .unwrap();

    let update = manager
        .update_provider_status(&ProviderId::new("P9"), ProviderStatus::Verified, None)
        .await
        .unwrap();
    assert!(update.changed);
    assert_eq!(update.previous, ProviderStatus::Pending);
    assert_eq!(update.provider.reviewed_by.as_deref(), Some("admin"));

    let again = manager
        .update_provider_status(&ProviderId::new("P9"), ProviderStatus::Verified, None)
        .await
        .unwrap();
    assert!(!again.changed);

    manager
        .update_provider_status(
            &ProviderId::new("P9"),
            ProviderStatus::Suspended,
            Some("ops-2".to_string()),
        )
        .await
        .unwrap();

    let pushes = sent_to(&transport, "p9-tablet");
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].notification.data["status"], "verified");
    assert_eq!(pushes[0].notification.data["action"], "verified");

    let stored = storage.get_provider(&ProviderId::new("P9")).await.unwrap();
    assert_eq!(stored.status, ProviderStatus::Suspended);
    assert_eq!(stored.previous_status, Some(ProviderStatus::Verified));
    assert_eq!(stored.reviewed_by.as_deref(), Some("ops-2"));
}

#[test_log::test(tokio::test)]
async fn test_transport_error_counts_as_failed_send() {
    let storage = Arc::new(InMemoryStorage::new());
    storage
        .register_device_token(&provider("P1"), "flaky")
        .await
        .unwrap();
    let transport = MockPushTransport::new();
    transport.add_response(
        "flaky",
        Err(gavel::GavelError::Other(anyhow::anyhow!("connection reset"))),
    );
    let notifier = FcmNotifier::new(transport, storage.clone());

    let report = notifier
        .notify(
            &provider("P1"),
            &gavel::Notification::status_changed(&ProviderId::new("P1"), ProviderStatus::Active),
        )
        .await
        .unwrap();

    assert_eq!(
        report,
        DeliveryReport {
            delivered: false,
            recipient_invalid: false,
            sent: 0,
            failed: 1,
        }
    );
    assert_eq!(
        storage.device_tokens(&provider("P1")).await.unwrap(),
        vec!["flaky"]
    );
}
