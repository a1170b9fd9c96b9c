//! Configuration for the bidding manager, the push notifier and the server.

use std::env;

use serde::{Deserialize, Serialize};

/// Reason stamped on sibling bids when another bid wins.
pub const ANOTHER_BID_SELECTED: &str = "another bid selected";

/// Configuration for bidding sessions and bids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiddingConfig {
    /// How long a session accepts bids after it is opened (milliseconds)
    pub session_window_ms: u64,

    /// How long a submitted bid stays valid (milliseconds)
    pub bid_ttl_ms: u64,

    /// Maximum number of bids a session records
    pub max_bids_per_session: u32,

    /// Reason recorded on bids rejected because another bid was accepted
    pub rejection_reason: String,
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            session_window_ms: 2 * 60 * 60 * 1000, // 2 hours
            bid_ttl_ms: 2 * 60 * 60 * 1000,        // 2 hours
            max_bids_per_session: 10,
            rejection_reason: ANOTHER_BID_SELECTED.to_string(),
        }
    }
}

impl BiddingConfig {
    pub fn session_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.session_window_ms as i64)
    }

    pub fn bid_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.bid_ttl_ms as i64)
    }
}

/// Push service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Base URL of the FCM-compatible service
    pub endpoint: String,
    pub project_id: String,
    /// OAuth access token sent as a bearer token; empty disables the header
    pub access_token: String,
    /// Per-message timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://fcm.googleapis.com".to_string(),
            project_id: String::new(),
            access_token: String::new(),
            timeout_ms: 10_000,
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,
    /// PostgreSQL URL; the in-memory store is used when unset
    pub database_url: Option<String>,
    pub bidding: BiddingConfig,
    /// Push settings; notifications are only logged when unset
    pub push: Option<PushConfig>,
}

impl ServerConfig {
    /// Load configuration from `GAVEL_*` environment variables with
    /// defaults for anything unset.
    ///
    /// # Errors
    /// Returns an error when a numeric variable does not parse.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = BiddingConfig::default();
        let bidding = BiddingConfig {
            session_window_ms: parse_env("GAVEL_SESSION_WINDOW_MS", defaults.session_window_ms)?,
            bid_ttl_ms: parse_env("GAVEL_BID_TTL_MS", defaults.bid_ttl_ms)?,
            max_bids_per_session: parse_env(
                "GAVEL_MAX_BIDS_PER_SESSION",
                defaults.max_bids_per_session,
            )?,
            rejection_reason: defaults.rejection_reason,
        };

        let push = match env::var("GAVEL_PUSH_PROJECT_ID") {
            Ok(project_id) if !project_id.is_empty() => {
                let push_defaults = PushConfig::default();
                Some(PushConfig {
                    endpoint: env::var("GAVEL_PUSH_ENDPOINT").unwrap_or(push_defaults.endpoint),
                    project_id,
                    access_token: env::var("GAVEL_PUSH_ACCESS_TOKEN").unwrap_or_default(),
                    timeout_ms: parse_env("GAVEL_PUSH_TIMEOUT_MS", push_defaults.timeout_ms)?,
                })
            }
            _ => None,
        };

        Ok(Self {
            bind_addr: env::var("GAVEL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            bidding,
            push,
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, raw, e)),
        Err(_) => Ok(default),
    }
}
