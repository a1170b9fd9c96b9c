//! Error types for the bidding system.

use thiserror::Error;

use crate::domain::bid::BidId;
use crate::domain::provider::ProviderId;
use crate::domain::request::{RequestId, RequestStatus};
use crate::domain::session::SessionId;

/// Result type alias using the gavel error type.
pub type Result<T> = std::result::Result<T, GavelError>;

/// Main error type for the bidding system.
#[derive(Error, Debug)]
pub enum GavelError {
    /// Missing or malformed input field
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// Bid not found
    #[error("Bid not found: {0}")]
    BidNotFound(BidId),

    /// No bidding session matches the lookup
    #[error("Bidding session not found: {0}")]
    SessionNotFound(String),

    /// Provider not found
    #[error("Provider not found: {0}")]
    ProviderNotFound(ProviderId),

    /// Caller does not own the request
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Request is in a state that does not allow the requested transition
    #[error("Invalid state transition: request {0} is in state '{1}', cannot move to '{2}'")]
    InvalidTransition(RequestId, RequestStatus, RequestStatus),

    /// An active bidding session already exists for the request
    #[error("Request {0} already has an active bidding session")]
    DuplicateSession(RequestId),

    /// The provider already holds a pending bid on the request
    #[error("Provider {1} already has a pending bid on request {0}")]
    DuplicateBid(RequestId, ProviderId),

    /// The session was completed before
    #[error("Bidding session {0} is already completed")]
    AlreadyCompleted(SessionId),

    /// The request no longer accepts bids
    #[error("Request {0} is not open for bidding (status '{1}')")]
    BiddingClosed(RequestId, RequestStatus),

    /// The session reached its bid cap
    #[error("Bidding session {0} has reached its limit of {1} bids")]
    SessionFull(SessionId, u32),

    /// A precondition of an atomic resolution no longer held at commit time
    #[error("Resolution for request {0} is stale: {1}")]
    StaleResolution(RequestId, String),

    /// The session deadline has passed
    #[error("Bidding session {0} expired")]
    SessionExpired(SessionId),

    /// Backing store failure (timeout, unavailable, connection error)
    #[error("Store error: {0}")]
    Store(String),

    /// Push transport error
    #[error("Push request failed: {0}")]
    Push(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse error classification used by callers to decide on retries and by
/// the API to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Conflict,
    Expired,
    TransientStore,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Expired => "expired",
            ErrorKind::TransientStore => "transient_store",
            ErrorKind::Internal => "internal",
        }
    }
}

impl GavelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GavelError::Validation(_) => ErrorKind::Validation,
            GavelError::RequestNotFound(_)
            | GavelError::BidNotFound(_)
            | GavelError::SessionNotFound(_)
            | GavelError::ProviderNotFound(_) => ErrorKind::NotFound,
            GavelError::Unauthorized(_) => ErrorKind::Unauthorized,
            GavelError::InvalidTransition(..)
            | GavelError::DuplicateSession(_)
            | GavelError::DuplicateBid(..)
            | GavelError::AlreadyCompleted(_)
            | GavelError::BiddingClosed(..)
            | GavelError::SessionFull(..)
            | GavelError::StaleResolution(..) => ErrorKind::Conflict,
            GavelError::SessionExpired(_) => ErrorKind::Expired,
            GavelError::Store(_) => ErrorKind::TransientStore,
            GavelError::Push(_) | GavelError::Serialization(_) | GavelError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Only store failures are worth retrying: every operation is either
    /// idempotent or conditionally atomic, so a full retry is safe.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientStore
    }

    /// HTTP status code for the request/response surface.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::Unauthorized => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Expired => 410,
            ErrorKind::TransientStore => 503,
            ErrorKind::Internal => 500,
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for GavelError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            // A row we cannot decode will not decode on retry either
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => GavelError::Other(e.into()),
            _ => GavelError::Store(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicts_map_to_409() {
        let id = RequestId::from(uuid::Uuid::new_v4());
        let err = GavelError::DuplicateSession(id);
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.status_code(), 409);
        assert!(!err.is_retryable());

        let err = GavelError::DuplicateBid(id, ProviderId::new("p1"));
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(GavelError::Store("connection reset".to_string()).is_retryable());
        assert_eq!(GavelError::Store("timeout".to_string()).status_code(), 503);
        assert!(!GavelError::Validation("priceQuote".to_string()).is_retryable());
        assert!(!GavelError::Unauthorized("owner mismatch".to_string()).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        let id = RequestId::from(uuid::Uuid::new_v4());
        assert_eq!(GavelError::Validation("x".into()).status_code(), 400);
        assert_eq!(GavelError::Unauthorized("x".into()).status_code(), 403);
        assert_eq!(GavelError::RequestNotFound(id).status_code(), 404);
        assert_eq!(
            GavelError::SessionExpired(SessionId::from(uuid::Uuid::new_v4())).status_code(),
            410
        );
        assert_eq!(
            GavelError::Other(anyhow::anyhow!("boom")).status_code(),
            500
        );
    }
}
