//! Service requests and their forward-only status lifecycle.
//!
//! ```text
//! Pending ──match──> Matched ──first bid──> Bidding ──accept──> Assigned
//!                       └──────────────accept───────────────────────┘
//! ```
//!
//! Status never regresses. Every transition is planned against the current
//! status first ([`RequestStatus::plan`]) and then applied by the store as a
//! compare-and-set, so duplicate trigger deliveries collapse into no-ops.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bid::BidId;
use super::provider::ProviderId;

/// Unique identifier for a service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Account id of the customer who owns a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Matched,
    Bidding,
    Assigned,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Matched => "matched",
            RequestStatus::Bidding => "bidding",
            RequestStatus::Assigned => "assigned",
        }
    }

    /// Whether providers may still submit bids.
    pub fn accepts_bids(&self) -> bool {
        matches!(self, RequestStatus::Matched | RequestStatus::Bidding)
    }

    /// Decide what applying `mutation` to a request currently in `self`
    /// should do. Pure; the store performs the actual compare-and-set.
    pub fn plan(&self, mutation: &RequestMutation) -> TransitionPlan {
        use RequestStatus::*;

        match (self, mutation) {
            (Pending, RequestMutation::Match { .. }) => TransitionPlan::Apply,
            (Matched, RequestMutation::Match { .. }) => TransitionPlan::Unchanged,
            (Bidding | Assigned, RequestMutation::Match { .. }) => TransitionPlan::Invalid,

            (Matched, RequestMutation::StartBidding) => TransitionPlan::Apply,
            (Bidding | Assigned, RequestMutation::StartBidding) => TransitionPlan::Unchanged,
            (Pending, RequestMutation::StartBidding) => TransitionPlan::Invalid,

            (Matched | Bidding, RequestMutation::Assign { .. }) => TransitionPlan::Apply,
            (Assigned, RequestMutation::Assign { .. }) => TransitionPlan::Unchanged,
            (Pending, RequestMutation::Assign { .. }) => TransitionPlan::Invalid,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "matched" => Ok(RequestStatus::Matched),
            "bidding" => Ok(RequestStatus::Bidding),
            "assigned" => Ok(RequestStatus::Assigned),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

/// A forward transition of a request, with the fields it stamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestMutation {
    /// pending → matched, recording the matched providers
    Match { provider_ids: BTreeSet<ProviderId> },
    /// matched → bidding, on the first recorded bid
    StartBidding,
    /// matched|bidding → assigned, terminal
    Assign { provider_id: ProviderId, bid_id: BidId },
}

impl RequestMutation {
    pub fn target(&self) -> RequestStatus {
        match self {
            RequestMutation::Match { .. } => RequestStatus::Matched,
            RequestMutation::StartBidding => RequestStatus::Bidding,
            RequestMutation::Assign { .. } => RequestStatus::Assigned,
        }
    }

    /// Apply the mutation's fields to an in-memory copy of the request.
    pub fn apply_to(&self, request: &mut ServiceRequest, now: DateTime<Utc>) {
        match self {
            RequestMutation::Match { provider_ids } => {
                request.matched_provider_ids = provider_ids.clone();
            }
            RequestMutation::StartBidding => {}
            RequestMutation::Assign {
                provider_id,
                bid_id,
            } => {
                request.assigned_provider_id = Some(provider_id.clone());
                request.selected_bid_id = Some(*bid_id);
            }
        }
        request.status = self.target();
        request.updated_at = now;
    }
}

/// Outcome of [`RequestStatus::plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    /// The transition should be written
    Apply,
    /// The request is already at (or past) the target; nothing to do
    Unchanged,
    /// The transition is not allowed from the current status
    Invalid,
}

/// Result of a lifecycle operation as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied,
    Unchanged,
}

/// AI price estimate attached to a request by the external matching process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceEstimate {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl PriceEstimate {
    /// An estimate is usable for benchmarking only when both bounds are
    /// finite, positive and ordered.
    pub fn is_usable(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.min > 0.0
            && self.max > 0.0
            && self.min <= self.max
    }
}

/// One customer's service ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: RequestId,
    pub owner_id: UserId,
    pub service_category: String,
    pub description: String,
    pub price_estimate: Option<PriceEstimate>,
    pub matched_provider_ids: BTreeSet<ProviderId>,
    pub status: RequestStatus,
    pub assigned_provider_id: Option<ProviderId>,
    pub selected_bid_id: Option<BidId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRequest {
    /// A freshly posted request, as the matching process would create it.
    pub fn new(
        owner_id: UserId,
        service_category: impl Into<String>,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RequestId(Uuid::new_v4()),
            owner_id,
            service_category: service_category.into(),
            description: description.into(),
            price_estimate: None,
            matched_provider_ids: BTreeSet::new(),
            status: RequestStatus::Pending,
            assigned_provider_id: None,
            selected_bid_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_price_estimate(mut self, estimate: PriceEstimate) -> Self {
        self.price_estimate = Some(estimate);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign() -> RequestMutation {
        RequestMutation::Assign {
            provider_id: ProviderId::new("p1"),
            bid_id: BidId(Uuid::new_v4()),
        }
    }

    fn matched() -> RequestMutation {
        RequestMutation::Match {
            provider_ids: [ProviderId::new("p1")].into_iter().collect(),
        }
    }

    #[test]
    fn test_match_is_idempotent_but_never_regresses() {
        assert_eq!(RequestStatus::Pending.plan(&matched()), TransitionPlan::Apply);
        assert_eq!(
            RequestStatus::Matched.plan(&matched()),
            TransitionPlan::Unchanged
        );
        assert_eq!(RequestStatus::Bidding.plan(&matched()), TransitionPlan::Invalid);
        assert_eq!(RequestStatus::Assigned.plan(&matched()), TransitionPlan::Invalid);
    }

    #[test]
    fn test_start_bidding_plan() {
        let m = RequestMutation::StartBidding;
        assert_eq!(RequestStatus::Pending.plan(&m), TransitionPlan::Invalid);
        assert_eq!(RequestStatus::Matched.plan(&m), TransitionPlan::Apply);
        assert_eq!(RequestStatus::Bidding.plan(&m), TransitionPlan::Unchanged);
        assert_eq!(RequestStatus::Assigned.plan(&m), TransitionPlan::Unchanged);
    }

    #[test]
    fn test_assign_plan() {
        assert_eq!(RequestStatus::Pending.plan(&assign()), TransitionPlan::Invalid);
        assert_eq!(RequestStatus::Matched.plan(&assign()), TransitionPlan::Apply);
        assert_eq!(RequestStatus::Bidding.plan(&assign()), TransitionPlan::Apply);
        assert_eq!(
            RequestStatus::Assigned.plan(&assign()),
            TransitionPlan::Unchanged
        );
    }

    #[test]
    fn test_apply_stamps_assignment() {
        let now = Utc::now();
        let mut request = ServiceRequest::new(UserId::new("u1"), "handyman", "fix sink", now);
        let bid_id = BidId(Uuid::new_v4());
        RequestMutation::Assign {
            provider_id: ProviderId::new("p2"),
            bid_id,
        }
        .apply_to(&mut request, now);

        assert_eq!(request.status, RequestStatus::Assigned);
        assert_eq!(request.assigned_provider_id, Some(ProviderId::new("p2")));
        assert_eq!(request.selected_bid_id, Some(bid_id));
    }

    #[test]
    fn test_estimate_usability() {
        let ok = PriceEstimate {
            min: 100.0,
            max: 150.0,
            confidence: Some(0.8),
        };
        assert!(ok.is_usable());
        assert!(!PriceEstimate { min: 0.0, ..ok }.is_usable());
        assert!(!PriceEstimate { max: -1.0, ..ok }.is_usable());
        assert!(!PriceEstimate { min: 200.0, ..ok }.is_usable());
        assert!(!PriceEstimate { min: f64::NAN, ..ok }.is_usable());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Matched,
            RequestStatus::Bidding,
            RequestStatus::Assigned,
        ] {
            assert_eq!(status.as_str().parse::<RequestStatus>(), Ok(status));
        }
        assert!("cancelled".parse::<RequestStatus>().is_err());
    }
}
