//! Provider bids and price benchmarking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::provider::ProviderId;
use super::request::{PriceEstimate, RequestId, UserId};

/// Unique identifier for a bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BidId(pub Uuid);

impl std::fmt::Display for BidId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for BidId {
    fn from(uuid: Uuid) -> Self {
        BidId(uuid)
    }
}

impl std::ops::Deref for BidId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Pending => "pending",
            BidStatus::Accepted => "accepted",
            BidStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for BidStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BidStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BidStatus::Pending),
            "accepted" => Ok(BidStatus::Accepted),
            "rejected" => Ok(BidStatus::Rejected),
            _ => Err(format!("Invalid bid status: {}", s)),
        }
    }
}

/// Coarse position of a quote relative to the AI price estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceBenchmark {
    Low,
    Normal,
    High,
}

impl PriceBenchmark {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceBenchmark::Low => "low",
            PriceBenchmark::Normal => "normal",
            PriceBenchmark::High => "high",
        }
    }
}

impl std::fmt::Display for PriceBenchmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PriceBenchmark {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(PriceBenchmark::Low),
            "normal" => Ok(PriceBenchmark::Normal),
            "high" => Ok(PriceBenchmark::High),
            _ => Err(format!("Invalid price benchmark: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Benchmark {
    pub benchmark: PriceBenchmark,
    /// False when no usable estimate was available and the benchmark fell
    /// back to `Normal`.
    pub is_ai_generated: bool,
}

/// Classify a quote against an estimate.
///
/// Total: a missing or unusable estimate degrades to `Normal` instead of
/// failing.
pub fn benchmark_price(price_quote: f64, estimate: Option<&PriceEstimate>) -> Benchmark {
    let Some(estimate) = estimate.filter(|e| e.is_usable()) else {
        return Benchmark {
            benchmark: PriceBenchmark::Normal,
            is_ai_generated: false,
        };
    };

    let benchmark = if price_quote < estimate.min {
        PriceBenchmark::Low
    } else if price_quote > estimate.max {
        PriceBenchmark::High
    } else {
        PriceBenchmark::Normal
    };

    Benchmark {
        benchmark,
        is_ai_generated: true,
    }
}

/// Input for [`BiddingManager::submit_bid`](crate::manager::BiddingManager::submit_bid).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBid {
    pub request_id: RequestId,
    pub provider_id: ProviderId,
    pub price_quote: f64,
    #[serde(default)]
    pub availability: String,
    #[serde(default)]
    pub message: String,
    /// Externally supplied estimate; falls back to the request's own
    /// estimate when absent.
    #[serde(default)]
    pub ai_estimate: Option<PriceEstimate>,
}

/// One provider's offer on a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub request_id: RequestId,
    pub provider_id: ProviderId,
    pub owner_id: UserId,
    pub price_quote: f64,
    pub availability: String,
    pub message: String,
    pub status: BidStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub price_benchmark: PriceBenchmark,
    pub is_ai_generated: bool,
}

impl Bid {
    pub fn is_pending(&self) -> bool {
        self.status == BidStatus::Pending
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
