//! Provider account status.

use serde::Serialize;

use crate::domain::notification::{Notification, Recipient};
use crate::domain::provider::{Provider, ProviderId, ProviderStatus, ProviderStatusChange};
use crate::error::{GavelError, Result};
use crate::notify::Notifier;
use crate::storage::Storage;

use super::BiddingManager;

/// Reviewer recorded when the caller does not name one.
pub const DEFAULT_REVIEWER: &str = "admin";

const MAX_STATUS_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatusUpdate {
    pub provider: Provider,
    pub previous: ProviderStatus,
    /// False when the provider already had the requested status.
    pub changed: bool,
}

impl<S: Storage + ?Sized, N: Notifier + ?Sized> BiddingManager<S, N> {
    pub async fn register_provider(&self, provider: Provider) -> Result<Provider> {
        if provider.id.as_str().trim().is_empty() {
            return Err(GavelError::Validation(
                "provider id must not be empty".to_string(),
            ));
        }
        self.storage.create_provider(&provider).await?;
        Ok(provider)
    }

    pub async fn get_provider(&self, provider_id: &ProviderId) -> Result<Provider> {
        self.storage.get_provider(provider_id).await
    }

    /// Register a device token for push delivery.
    pub async fn register_device_token(&self, recipient: &Recipient, token: &str) -> Result<()> {
        if token.trim().is_empty() {
            return Err(GavelError::Validation(
                "device token must not be empty".to_string(),
            ));
        }
        self.storage.register_device_token(recipient, token).await
    }

    /// Move a provider to `new_status`, stamping the previous status, time
    /// and reviewer. Setting the current status again is a no-op.
    ///
    /// Verified, active and rejected outcomes are pushed to the provider.
    #[tracing::instrument(skip(self), fields(provider_id = %provider_id, new_status = %new_status))]
    pub async fn update_provider_status(
        &self,
        provider_id: &ProviderId,
        new_status: ProviderStatus,
        reviewed_by: Option<String>,
    ) -> Result<ProviderStatusUpdate> {
        let reviewed_by = reviewed_by
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REVIEWER.to_string());

        for attempt in 1..=MAX_STATUS_ATTEMPTS {
            let provider = self.storage.get_provider(provider_id).await?;
            let previous = provider.status;

            if previous == new_status {
                tracing::info!(status = %previous, "Provider status unchanged");
                return Ok(ProviderStatusUpdate {
                    provider,
                    previous,
                    changed: false,
                });
            }

            let change = ProviderStatusChange {
                expected: previous,
                new_status,
                reviewed_by: reviewed_by.clone(),
                at: self.storage.now(),
            };
            if !self
                .storage
                .update_provider_status(provider_id, &change)
                .await?
            {
                tracing::debug!(attempt, "Provider status changed concurrently, retrying");
                continue;
            }

            tracing::info!(
                from = %previous,
                to = %new_status,
                reviewed_by = %reviewed_by,
                "Provider status updated"
            );

            if new_status.is_notifiable() {
                self.dispatch(
                    Recipient::Provider(provider_id.clone()),
                    Notification::status_changed(provider_id, new_status),
                )
                .await;
            }

            let mut provider = provider;
            change.apply_to(&mut provider);
            return Ok(ProviderStatusUpdate {
                provider,
                previous,
                changed: true,
            });
        }

        Err(GavelError::Store(format!(
            "provider {} kept changing during status update",
            provider_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::notification::NotificationKind;
    use crate::notify::MockNotifier;
    use crate::storage::InMemoryStorage;

    async fn setup() -> (
        BiddingManager<InMemoryStorage, MockNotifier>,
        Arc<MockNotifier>,
        ProviderId,
    ) {
        let storage = Arc::new(InMemoryStorage::new());
        let notifier = Arc::new(MockNotifier::new());
        let manager = BiddingManager::new(storage, notifier.clone());
        let id = ProviderId::new("p1");
        manager
            .register_provider(Provider::new(id.clone(), "Sparkle Cleaning"))
            .await
            .unwrap();
        (manager, notifier, id)
    }

    #[test_log::test(tokio::test)]
    async fn test_verification_notifies_once() {
        let (manager, notifier, id) = setup().await;

        let update = manager
            .update_provider_status(&id, ProviderStatus::Verified, Some("reviewer-7".into()))
            .await
            .unwrap();

        assert!(update.changed);
        assert_eq!(update.previous, ProviderStatus::Pending);
        assert_eq!(update.provider.previous_status, Some(ProviderStatus::Pending));
        assert_eq!(update.provider.reviewed_by.as_deref(), Some("reviewer-7"));

        let calls = notifier.calls_for(&Recipient::Provider(id.clone()));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, NotificationKind::StatusChanged);
        assert_eq!(calls[0].title, "Account Verified!");
    }

    #[test_log::test(tokio::test)]
    async fn test_same_status_is_a_noop() {
        let (manager, notifier, id) = setup().await;
        manager
            .update_provider_status(&id, ProviderStatus::Verified, None)
            .await
            .unwrap();
        notifier.clear_calls();

        let update = manager
            .update_provider_status(&id, ProviderStatus::Verified, None)
            .await
            .unwrap();

        assert!(!update.changed);
        assert_eq!(notifier.call_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_rejection_and_suspension() {
        let (manager, notifier, id) = setup().await;

        manager
            .update_provider_status(&id, ProviderStatus::Rejected, None)
            .await
            .unwrap();
        let calls = notifier.calls_for(&Recipient::Provider(id.clone()));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].title, "Application Update");

        let update = manager
            .update_provider_status(&id, ProviderStatus::Suspended, None)
            .await
            .unwrap();
        assert!(update.changed);
        assert_eq!(update.provider.reviewed_by.as_deref(), Some("admin"));
        assert_eq!(notifier.call_count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_provider() {
        let (manager, _, _) = setup().await;
        let err = manager
            .update_provider_status(&ProviderId::new("ghost"), ProviderStatus::Active, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GavelError::ProviderNotFound(_)));
    }
}
