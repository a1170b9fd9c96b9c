//! State transitions for bidding sessions.
//!
//! ```text
//! BiddingSession<Active> ──complete()──> BiddingSession<Completed>
//!        │
//!        └── record_bid() (union append, stays Active)
//! ```
//!
//! Expiry is not a state: an active session whose deadline has passed is
//! *expired* for new bids but can still be completed by an accept.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::bid::BidId;
use crate::domain::provider::ProviderId;
use crate::domain::request::{RequestId, UserId};

use super::state::{Active, BiddingSession, Completed, SessionData, SessionId};

impl BiddingSession<Active> {
    pub fn open(
        request_id: RequestId,
        owner_id: UserId,
        notified_provider_ids: BTreeSet<ProviderId>,
        deadline: DateTime<Utc>,
        max_bids: u32,
        now: DateTime<Utc>,
    ) -> Self {
        BiddingSession {
            state: Active {},
            data: SessionData {
                id: SessionId(Uuid::new_v4()),
                request_id,
                owner_id,
                notified_provider_ids,
                received_bid_ids: Vec::new(),
                max_bids,
                created_at: now,
                deadline,
            },
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.data.deadline
    }

    pub fn is_full(&self) -> bool {
        self.data.received_bid_ids.len() >= self.data.max_bids as usize
    }

    /// Append a bid id unless it is already present. Returns whether the
    /// list changed.
    pub fn record_bid(&mut self, bid_id: BidId) -> bool {
        if self.data.received_bid_ids.contains(&bid_id) {
            return false;
        }
        self.data.received_bid_ids.push(bid_id);
        true
    }

    pub fn complete(
        self,
        selected_bid_id: BidId,
        winning_provider_id: ProviderId,
        now: DateTime<Utc>,
    ) -> BiddingSession<Completed> {
        BiddingSession {
            data: self.data,
            state: Completed {
                completed_at: now,
                selected_bid_id,
                winning_provider_id,
            },
        }
    }
}
