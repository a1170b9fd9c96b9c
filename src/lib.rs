//! Bidding-session coordination for a service marketplace.
//!
//! Customers post service requests; an external matching process picks
//! candidate providers; the providers compete with bids; the request owner
//! accepts exactly one. [`BiddingManager`] runs every transition of that
//! flow against an explicit [`Storage`] handle so that duplicate deliveries
//! and concurrent callers converge on one accepted bid.
//!
//! Backends: [`InMemoryStorage`] (always available) and `PostgresStorage`
//! (feature `postgres`).

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod manager;
pub mod notify;
pub mod push;
pub mod storage;

// Re-export commonly used types
pub use config::{BiddingConfig, PushConfig, ServerConfig};
pub use domain::bid::{Bid, BidId, BidStatus, PriceBenchmark, SubmitBid, benchmark_price};
pub use domain::notification::{Notification, NotificationKind, Recipient};
pub use domain::provider::{Provider, ProviderId, ProviderStatus};
pub use domain::request::{
    PriceEstimate, RequestId, RequestStatus, ServiceRequest, TransitionOutcome, UserId,
};
pub use domain::session::{Active, AnySession, BiddingSession, Completed, SessionId};
pub use error::{ErrorKind, GavelError, Result};
pub use manager::{
    AcceptOutcome, BidReceipt, BiddingManager, OpenSession, ProviderStatusUpdate, SessionOpened,
};
pub use notify::{FcmNotifier, LogNotifier, MockNotifier, Notifier};
pub use push::{MockPushTransport, PushResponse, PushTransport, ReqwestPushTransport};
#[cfg(feature = "postgres")]
pub use storage::PostgresStorage;
pub use storage::{DeviceRegistry, InMemoryStorage, Storage};

/// Get the gavel database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
