//! Service providers and their account review status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account id of a service provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        ProviderId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Review status of a provider account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Pending,
    Verified,
    Active,
    Rejected,
    Suspended,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Pending => "pending",
            ProviderStatus::Verified => "verified",
            ProviderStatus::Active => "active",
            ProviderStatus::Rejected => "rejected",
            ProviderStatus::Suspended => "suspended",
        }
    }

    /// Statuses the provider is told about by push notification.
    pub fn is_notifiable(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Verified | ProviderStatus::Active | ProviderStatus::Rejected
        )
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProviderStatus::Pending),
            "verified" => Ok(ProviderStatus::Verified),
            "active" => Ok(ProviderStatus::Active),
            "rejected" => Ok(ProviderStatus::Rejected),
            "suspended" => Ok(ProviderStatus::Suspended),
            _ => Err(format!("Invalid provider status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub company_name: String,
    pub status: ProviderStatus,
    pub previous_status: Option<ProviderStatus>,
    pub status_updated_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
}

impl Provider {
    /// A newly registered provider awaiting review.
    pub fn new(id: ProviderId, company_name: impl Into<String>) -> Self {
        Self {
            id,
            company_name: company_name.into(),
            status: ProviderStatus::Pending,
            previous_status: None,
            status_updated_at: None,
            reviewed_by: None,
        }
    }
}

/// A reviewed status change, applied by the store only if the provider is
/// still in `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatusChange {
    pub expected: ProviderStatus,
    pub new_status: ProviderStatus,
    pub reviewed_by: String,
    pub at: DateTime<Utc>,
}

impl ProviderStatusChange {
    pub fn apply_to(&self, provider: &mut Provider) {
        provider.previous_status = Some(provider.status);
        provider.status = self.new_status;
        provider.status_updated_at = Some(self.at);
        provider.reviewed_by = Some(self.reviewed_by.clone());
    }
}
