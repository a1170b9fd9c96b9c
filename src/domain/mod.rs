//! Core domain types for the bidding system.
//!
//! Pure types with no persistence dependencies:
//! - Service requests and their status lifecycle
//! - Bidding sessions (typestate machine)
//! - Bids and price benchmarking
//! - Providers and notification payloads

pub mod bid;
pub mod notification;
pub mod provider;
pub mod request;
pub mod session;
