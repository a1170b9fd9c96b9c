//! Bidding session aggregate - one round of bidding on a request.
//!
//! This module contains:
//! - Session types and states (typestate pattern)
//! - State transition methods

pub mod state;
pub mod transitions;

pub use state::*;
