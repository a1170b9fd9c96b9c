//! Bidding session types.
//!
//! A session progresses `Active` → `Completed` exactly once. Each state is a
//! distinct type parameter on [`BiddingSession`], so only an active session
//! can be completed or take new bids.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::bid::BidId;
use crate::domain::provider::ProviderId;
use crate::domain::request::{RequestId, UserId};

/// Marker trait for valid session states.
pub trait SessionState: Send + Sync {}

/// A bidding session for one request.
#[derive(Debug, Clone, Serialize)]
pub struct BiddingSession<T: SessionState> {
    /// The current state of the session.
    pub state: T,
    /// Data shared by every state.
    pub data: SessionData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionData {
    pub id: SessionId,
    pub request_id: RequestId,
    pub owner_id: UserId,
    /// Providers told about the opportunity; fixed at creation.
    pub notified_provider_ids: BTreeSet<ProviderId>,
    /// Bids recorded against the session, in append order, without
    /// duplicates.
    pub received_bid_ids: Vec<BidId>,
    pub max_bids: u32,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

// ============================================================================
// Session States
// ============================================================================

/// Session is accepting bids (until its deadline) and can be completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Active {}

impl SessionState for Active {}

/// A bid was accepted; terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completed {
    pub completed_at: DateTime<Utc>,
    pub selected_bid_id: BidId,
    pub winning_provider_id: ProviderId,
}

impl SessionState for Completed {}

/// Unique identifier for a bidding session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        SessionId(uuid)
    }
}

impl std::ops::Deref for SessionId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Database value of the session status column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

// ============================================================================
// Unified Session Representation
// ============================================================================

/// Enum that can hold a session in any state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "sessionStatus", content = "session", rename_all = "lowercase")]
pub enum AnySession {
    Active(BiddingSession<Active>),
    Completed(BiddingSession<Completed>),
}

impl AnySession {
    pub fn id(&self) -> SessionId {
        self.data().id
    }

    pub fn data(&self) -> &SessionData {
        match self {
            AnySession::Active(s) => &s.data,
            AnySession::Completed(s) => &s.data,
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            AnySession::Active(_) => SessionStatus::Active,
            AnySession::Completed(_) => SessionStatus::Completed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnySession::Completed(_))
    }

    pub fn as_active(&self) -> Option<&BiddingSession<Active>> {
        match self {
            AnySession::Active(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_active(self) -> Option<BiddingSession<Active>> {
        match self {
            AnySession::Active(s) => Some(s),
            _ => None,
        }
    }
}

impl From<BiddingSession<Active>> for AnySession {
    fn from(s: BiddingSession<Active>) -> Self {
        AnySession::Active(s)
    }
}

impl From<BiddingSession<Completed>> for AnySession {
    fn from(s: BiddingSession<Completed>) -> Self {
        AnySession::Completed(s)
    }
}
