//! In-memory implementation of [`Storage`].
//!
//! All tables live behind one mutex, so every trait method is a single
//! critical section: conditional writes are atomic and a [`Resolution`] is
//! validated in full before any of it is applied.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::{DeviceRegistry, Resolution, ResolutionStep, Storage};
use crate::domain::bid::{Bid, BidId, BidStatus};
use crate::domain::notification::{NotificationRecord, Recipient};
use crate::domain::provider::{Provider, ProviderId, ProviderStatus, ProviderStatusChange};
use crate::domain::request::{RequestId, RequestMutation, RequestStatus, ServiceRequest};
use crate::domain::session::{Active, AnySession, BiddingSession, Completed, SessionId};
use crate::error::{GavelError, Result};

#[derive(Default)]
struct Tables {
    requests: HashMap<RequestId, ServiceRequest>,
    sessions: HashMap<SessionId, AnySession>,
    /// Insertion order per request, for `list_sessions`.
    sessions_by_request: HashMap<RequestId, Vec<SessionId>>,
    bids: HashMap<BidId, Bid>,
    bids_by_request: HashMap<RequestId, Vec<BidId>>,
    providers: HashMap<ProviderId, Provider>,
    device_tokens: BTreeMap<Recipient, Vec<String>>,
    notifications: Vec<NotificationRecord>,
}

impl Tables {
    fn active_session_id(&self, request_id: RequestId) -> Option<SessionId> {
        self.sessions_by_request
            .get(&request_id)?
            .iter()
            .copied()
            .find(|id| matches!(self.sessions.get(id), Some(AnySession::Active(_))))
    }

    fn unresolved_pending_bid(&self, resolution: &Resolution) -> Option<BidId> {
        let covered = resolution.bid_ids();
        self.bids_by_request
            .get(&resolution.request_id)?
            .iter()
            .copied()
            .find(|id| {
                !covered.contains(id) && self.bids.get(id).is_some_and(|bid| bid.is_pending())
            })
    }

    fn check_step(&self, step: &ResolutionStep) -> std::result::Result<(), String> {
        match step {
            ResolutionStep::AcceptBid { bid_id } | ResolutionStep::RejectBid { bid_id, .. } => {
                match self.bids.get(bid_id) {
                    Some(bid) if bid.is_pending() => Ok(()),
                    Some(bid) => Err(format!("bid {} is already {}", bid_id, bid.status)),
                    None => Err(format!("bid {} does not exist", bid_id)),
                }
            }
            ResolutionStep::CompleteSession { session_id, .. } => {
                match self.sessions.get(session_id) {
                    Some(AnySession::Active(_)) => Ok(()),
                    Some(AnySession::Completed(_)) => {
                        Err(format!("session {} is already completed", session_id))
                    }
                    None => Err(format!("session {} does not exist", session_id)),
                }
            }
            ResolutionStep::AssignRequest {
                request_id,
                expected,
                ..
            } => match self.requests.get(request_id) {
                Some(request) if request.status == *expected => Ok(()),
                Some(request) => Err(format!(
                    "request {} is {}, expected {}",
                    request_id, request.status, expected
                )),
                None => Err(format!("request {} does not exist", request_id)),
            },
        }
    }

    fn apply_step(&mut self, step: &ResolutionStep, at: DateTime<Utc>) {
        match step {
            ResolutionStep::AcceptBid { bid_id } => {
                if let Some(bid) = self.bids.get_mut(bid_id) {
                    bid.status = BidStatus::Accepted;
                }
            }
            ResolutionStep::RejectBid { bid_id, reason } => {
                if let Some(bid) = self.bids.get_mut(bid_id) {
                    bid.status = BidStatus::Rejected;
                    bid.rejection_reason = Some(reason.clone());
                }
            }
            ResolutionStep::CompleteSession {
                session_id,
                selected_bid_id,
                winning_provider_id,
            } => {
                if let Some(AnySession::Active(session)) = self.sessions.remove(session_id) {
                    let completed =
                        session.complete(*selected_bid_id, winning_provider_id.clone(), at);
                    self.sessions.insert(*session_id, completed.into());
                }
            }
            ResolutionStep::AssignRequest {
                request_id,
                provider_id,
                bid_id,
                ..
            } => {
                if let Some(request) = self.requests.get_mut(request_id) {
                    RequestMutation::Assign {
                        provider_id: provider_id.clone(),
                        bid_id: *bid_id,
                    }
                    .apply_to(request, at);
                }
            }
        }
    }
}

enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

/// Storage backed by process memory. Used by tests and the demo server.
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
    clock: Mutex<Clock>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            clock: Mutex::new(Clock::System),
        }
    }

    /// Freeze the store clock at `now`.
    pub fn with_fixed_time(self, now: DateTime<Utc>) -> Self {
        *self.clock.lock() = Clock::Fixed(now);
        self
    }

    /// Move the store clock forward. Freezes a system clock at the current
    /// time first.
    pub fn advance(&self, by: Duration) {
        let mut clock = self.clock.lock();
        let now = match *clock {
            Clock::System => Utc::now(),
            Clock::Fixed(t) => t,
        };
        *clock = Clock::Fixed(now + by);
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryStorage {
    async fn register_device_token(&self, recipient: &Recipient, token: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        let tokens = tables.device_tokens.entry(recipient.clone()).or_default();
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
        Ok(())
    }

    async fn device_tokens(&self, recipient: &Recipient) -> Result<Vec<String>> {
        Ok(self
            .tables
            .lock()
            .device_tokens
            .get(recipient)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_device_tokens(
        &self,
        recipient: &Recipient,
        tokens: &[String],
    ) -> Result<usize> {
        let mut tables = self.tables.lock();
        let Some(existing) = tables.device_tokens.get_mut(recipient) else {
            return Ok(0);
        };
        let before = existing.len();
        existing.retain(|t| !tokens.contains(t));
        Ok(before - existing.len())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    fn now(&self) -> DateTime<Utc> {
        match *self.clock.lock() {
            Clock::System => Utc::now(),
            Clock::Fixed(t) => t,
        }
    }

    async fn create_request(&self, request: &ServiceRequest) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.requests.contains_key(&request.id) {
            return Err(GavelError::Validation(format!(
                "request {} already exists",
                request.id
            )));
        }
        tables.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<ServiceRequest> {
        self.tables
            .lock()
            .requests
            .get(&id)
            .cloned()
            .ok_or(GavelError::RequestNotFound(id))
    }

    async fn transition_request(
        &self,
        id: RequestId,
        expected: RequestStatus,
        mutation: &RequestMutation,
    ) -> Result<bool> {
        let now = self.now();
        let mut tables = self.tables.lock();
        let request = tables
            .requests
            .get_mut(&id)
            .ok_or(GavelError::RequestNotFound(id))?;
        if request.status != expected {
            return Ok(false);
        }
        mutation.apply_to(request, now);
        Ok(true)
    }

    async fn open_session(&self, session: &BiddingSession<Active>) -> Result<()> {
        let request_id = session.data.request_id;
        let mut tables = self.tables.lock();
        if tables.active_session_id(request_id).is_some() {
            return Err(GavelError::DuplicateSession(request_id));
        }
        tables
            .sessions
            .insert(session.data.id, session.clone().into());
        tables
            .sessions_by_request
            .entry(request_id)
            .or_default()
            .push(session.data.id);
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<AnySession> {
        self.tables
            .lock()
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| GavelError::SessionNotFound(id.0.to_string()))
    }

    async fn find_active_session(
        &self,
        request_id: RequestId,
    ) -> Result<Option<BiddingSession<Active>>> {
        let tables = self.tables.lock();
        Ok(tables
            .active_session_id(request_id)
            .and_then(|id| tables.sessions.get(&id))
            .and_then(|s| s.as_active().cloned()))
    }

    async fn list_sessions(&self, request_id: RequestId) -> Result<Vec<AnySession>> {
        let tables = self.tables.lock();
        Ok(tables
            .sessions_by_request
            .get(&request_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append_session_bid(&self, session_id: SessionId, bid_id: BidId) -> Result<()> {
        let mut tables = self.tables.lock();
        match tables.sessions.get_mut(&session_id) {
            Some(AnySession::Active(session)) => {
                session.record_bid(bid_id);
                Ok(())
            }
            Some(AnySession::Completed(_)) => Err(GavelError::AlreadyCompleted(session_id)),
            None => Err(GavelError::SessionNotFound(session_id.0.to_string())),
        }
    }

    async fn complete_session(
        &self,
        session_id: SessionId,
        selected_bid_id: BidId,
        winning_provider_id: &ProviderId,
    ) -> Result<BiddingSession<Completed>> {
        let now = self.now();
        let mut tables = self.tables.lock();
        match tables.sessions.get(&session_id) {
            Some(AnySession::Active(_)) => {}
            Some(AnySession::Completed(_)) => {
                return Err(GavelError::AlreadyCompleted(session_id));
            }
            None => return Err(GavelError::SessionNotFound(session_id.0.to_string())),
        }
        let Some(AnySession::Active(session)) = tables.sessions.remove(&session_id) else {
            return Err(GavelError::SessionNotFound(session_id.0.to_string()));
        };
        let completed = session.complete(selected_bid_id, winning_provider_id.clone(), now);
        tables
            .sessions
            .insert(session_id, completed.clone().into());
        Ok(completed)
    }

    async fn insert_bid(&self, bid: &Bid, session_id: SessionId) -> Result<()> {
        let mut tables = self.tables.lock();
        let status = tables
            .requests
            .get(&bid.request_id)
            .map(|r| r.status)
            .ok_or(GavelError::RequestNotFound(bid.request_id))?;
        if !status.accepts_bids() {
            return Err(GavelError::BiddingClosed(bid.request_id, status));
        }

        match tables.sessions.get(&session_id) {
            Some(AnySession::Active(session)) if session.data.request_id == bid.request_id => {
                if session.is_full() {
                    return Err(GavelError::SessionFull(session_id, session.data.max_bids));
                }
            }
            Some(AnySession::Completed(_)) => return Err(GavelError::AlreadyCompleted(session_id)),
            _ => return Err(GavelError::SessionNotFound(session_id.0.to_string())),
        }

        let duplicate = tables
            .bids_by_request
            .get(&bid.request_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.bids.get(id))
            .any(|existing| existing.provider_id == bid.provider_id && existing.is_pending());
        if duplicate {
            return Err(GavelError::DuplicateBid(
                bid.request_id,
                bid.provider_id.clone(),
            ));
        }

        tables.bids.insert(bid.id, bid.clone());
        tables
            .bids_by_request
            .entry(bid.request_id)
            .or_default()
            .push(bid.id);
        if let Some(AnySession::Active(session)) = tables.sessions.get_mut(&session_id) {
            session.record_bid(bid.id);
        }
        Ok(())
    }

    async fn get_bid(&self, id: BidId) -> Result<Bid> {
        self.tables
            .lock()
            .bids
            .get(&id)
            .cloned()
            .ok_or(GavelError::BidNotFound(id))
    }

    async fn list_bids(&self, request_id: RequestId) -> Result<Vec<Bid>> {
        let tables = self.tables.lock();
        Ok(tables
            .bids_by_request
            .get(&request_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.bids.get(id).cloned())
            .collect())
    }

    async fn count_bids(&self, request_id: RequestId) -> Result<usize> {
        Ok(self
            .tables
            .lock()
            .bids_by_request
            .get(&request_id)
            .map_or(0, Vec::len))
    }

    async fn apply_resolution(&self, resolution: &Resolution) -> Result<()> {
        let mut tables = self.tables.lock();
        for step in &resolution.steps {
            tables
                .check_step(step)
                .map_err(|reason| GavelError::StaleResolution(resolution.request_id, reason))?;
        }
        if let Some(stray) = tables.unresolved_pending_bid(resolution) {
            return Err(GavelError::StaleResolution(
                resolution.request_id,
                format!("bid {} is pending but not part of the resolution", stray),
            ));
        }
        for step in &resolution.steps {
            tables.apply_step(step, resolution.at);
        }
        Ok(())
    }

    async fn create_provider(&self, provider: &Provider) -> Result<()> {
        self.tables
            .lock()
            .providers
            .insert(provider.id.clone(), provider.clone());
        Ok(())
    }

    async fn get_provider(&self, id: &ProviderId) -> Result<Provider> {
        self.tables
            .lock()
            .providers
            .get(id)
            .cloned()
            .ok_or_else(|| GavelError::ProviderNotFound(id.clone()))
    }

    async fn update_provider_status(
        &self,
        id: &ProviderId,
        change: &ProviderStatusChange,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        let provider = tables
            .providers
            .get_mut(id)
            .ok_or_else(|| GavelError::ProviderNotFound(id.clone()))?;
        if provider.status != change.expected {
            return Ok(false);
        }
        change.apply_to(provider);
        Ok(true)
    }

    async fn list_providers(&self, status: Option<ProviderStatus>) -> Result<Vec<Provider>> {
        let tables = self.tables.lock();
        let mut providers: Vec<Provider> = tables
            .providers
            .values()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .cloned()
            .collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(providers)
    }

    async fn record_notification(&self, record: &NotificationRecord) -> Result<()> {
        self.tables.lock().notifications.push(record.clone());
        Ok(())
    }

    async fn list_notifications(&self, recipient: &Recipient) -> Result<Vec<NotificationRecord>> {
        Ok(self
            .tables
            .lock()
            .notifications
            .iter()
            .filter(|n| &n.recipient == recipient)
            .cloned()
            .collect())
    }
}
