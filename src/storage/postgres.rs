//! PostgreSQL implementation of [`Storage`].
//!
//! Uniqueness rules live in partial unique indexes (one active session per
//! request, one pending bid per provider and request), so concurrent inserts
//! are settled by the database. Conditional updates check `rows_affected`,
//! and a [`Resolution`] runs in one transaction that first locks the request
//! row, so concurrent accepts on the same request are serialized.

use std::collections::BTreeSet;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

use super::{DeviceRegistry, Resolution, ResolutionStep, Storage};
use crate::domain::bid::{Bid, BidId};
use crate::domain::notification::{NotificationRecord, Recipient};
use crate::domain::provider::{Provider, ProviderId, ProviderStatus, ProviderStatusChange};
use crate::domain::request::{
    PriceEstimate, RequestId, RequestMutation, RequestStatus, ServiceRequest, UserId,
};
use crate::domain::session::{
    Active, AnySession, BiddingSession, Completed, SessionData, SessionId, SessionStatus,
};
use crate::error::{GavelError, Result};

const REQUEST_COLUMNS: &str = "id, owner_id, service_category, description, price_min, \
    price_max, price_confidence, matched_provider_ids, status, assigned_provider_id, \
    selected_bid_id, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, request_id, owner_id, notified_provider_ids, \
    received_bid_ids, max_bids, status, created_at, deadline, completed_at, selected_bid_id, \
    winning_provider_id";

const BID_COLUMNS: &str = "id, request_id, provider_id, owner_id, price_quote, availability, \
    message, status, rejection_reason, created_at, expires_at, price_benchmark, is_ai_generated";

const PROVIDER_COLUMNS: &str =
    "id, company_name, status, previous_status, status_updated_at, reviewed_by";

/// PostgreSQL storage.
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect("postgresql://localhost/gavel").await?;
/// let storage = PostgresStorage::new(pool);
/// storage.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<()> {
        crate::migrator()
            .run(&self.pool)
            .await
            .map_err(|e| GavelError::Other(anyhow!("Failed to run migrations: {}", e)))
    }

    async fn request_exists(&self, id: RequestId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM service_requests WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn parse<T>(raw: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse()
        .map_err(|e: String| GavelError::Other(anyhow!("Corrupt row: {}", e)))
}

fn recipient_parts(recipient: &Recipient) -> (&'static str, &str) {
    (recipient.kind(), recipient.id())
}

fn recipient_from(kind: &str, id: String) -> Result<Recipient> {
    match kind {
        "user" => Ok(Recipient::User(UserId(id))),
        "provider" => Ok(Recipient::Provider(ProviderId(id))),
        other => Err(GavelError::Other(anyhow!(
            "Corrupt row: unknown recipient kind '{}'",
            other
        ))),
    }
}

fn provider_set(ids: Vec<String>) -> BTreeSet<ProviderId> {
    ids.into_iter().map(ProviderId).collect()
}

fn provider_vec(ids: &BTreeSet<ProviderId>) -> Vec<String> {
    ids.iter().map(|p| p.0.clone()).collect()
}

fn request_from_row(row: &PgRow) -> Result<ServiceRequest> {
    let price_min: Option<f64> = row.try_get("price_min")?;
    let price_max: Option<f64> = row.try_get("price_max")?;
    let price_estimate = match (price_min, price_max) {
        (Some(min), Some(max)) => Some(PriceEstimate {
            min,
            max,
            confidence: row.try_get("price_confidence")?,
        }),
        _ => None,
    };

    Ok(ServiceRequest {
        id: RequestId(row.try_get("id")?),
        owner_id: UserId(row.try_get("owner_id")?),
        service_category: row.try_get("service_category")?,
        description: row.try_get("description")?,
        price_estimate,
        matched_provider_ids: provider_set(row.try_get("matched_provider_ids")?),
        status: parse(row.try_get::<&str, _>("status")?)?,
        assigned_provider_id: row
            .try_get::<Option<String>, _>("assigned_provider_id")?
            .map(ProviderId),
        selected_bid_id: row.try_get::<Option<Uuid>, _>("selected_bid_id")?.map(BidId),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<AnySession> {
    let max_bids: i32 = row.try_get("max_bids")?;
    let received: Vec<Uuid> = row.try_get("received_bid_ids")?;
    let data = SessionData {
        id: SessionId(row.try_get("id")?),
        request_id: RequestId(row.try_get("request_id")?),
        owner_id: UserId(row.try_get("owner_id")?),
        notified_provider_ids: provider_set(row.try_get("notified_provider_ids")?),
        received_bid_ids: received.into_iter().map(BidId).collect(),
        max_bids: max_bids.max(0) as u32,
        created_at: row.try_get("created_at")?,
        deadline: row.try_get("deadline")?,
    };

    match parse::<SessionStatus>(row.try_get::<&str, _>("status")?)? {
        SessionStatus::Active => Ok(BiddingSession {
            state: Active {},
            data,
        }
        .into()),
        SessionStatus::Completed => {
            let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;
            let selected: Option<Uuid> = row.try_get("selected_bid_id")?;
            let winner: Option<String> = row.try_get("winning_provider_id")?;
            let (Some(completed_at), Some(selected), Some(winner)) =
                (completed_at, selected, winner)
            else {
                return Err(GavelError::Other(anyhow!(
                    "Corrupt row: completed session {} lacks its resolution",
                    data.id
                )));
            };
            Ok(BiddingSession {
                state: Completed {
                    completed_at,
                    selected_bid_id: BidId(selected),
                    winning_provider_id: ProviderId(winner),
                },
                data,
            }
            .into())
        }
    }
}

fn bid_from_row(row: &PgRow) -> Result<Bid> {
    Ok(Bid {
        id: BidId(row.try_get("id")?),
        request_id: RequestId(row.try_get("request_id")?),
        provider_id: ProviderId(row.try_get("provider_id")?),
        owner_id: UserId(row.try_get("owner_id")?),
        price_quote: row.try_get("price_quote")?,
        availability: row.try_get("availability")?,
        message: row.try_get("message")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        rejection_reason: row.try_get("rejection_reason")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        price_benchmark: parse(row.try_get::<&str, _>("price_benchmark")?)?,
        is_ai_generated: row.try_get("is_ai_generated")?,
    })
}

fn provider_from_row(row: &PgRow) -> Result<Provider> {
    let previous: Option<String> = row.try_get("previous_status")?;
    Ok(Provider {
        id: ProviderId(row.try_get("id")?),
        company_name: row.try_get("company_name")?,
        status: parse(row.try_get::<&str, _>("status")?)?,
        previous_status: previous.as_deref().map(parse).transpose()?,
        status_updated_at: row.try_get("status_updated_at")?,
        reviewed_by: row.try_get("reviewed_by")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<NotificationRecord> {
    let kind: String = row.try_get("recipient_kind")?;
    Ok(NotificationRecord {
        id: row.try_get("id")?,
        recipient: recipient_from(&kind, row.try_get("recipient_id")?)?,
        kind: parse(row.try_get::<&str, _>("kind")?)?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        request_id: row.try_get::<Option<Uuid>, _>("request_id")?.map(RequestId),
        delivered: row.try_get("delivered")?,
        recipient_invalid: row.try_get("recipient_invalid")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl DeviceRegistry for PostgresStorage {
    async fn register_device_token(&self, recipient: &Recipient, token: &str) -> Result<()> {
        let (kind, id) = recipient_parts(recipient);
        sqlx::query(
            r#"
            INSERT INTO device_tokens (recipient_kind, recipient_id, token)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(kind)
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn device_tokens(&self, recipient: &Recipient) -> Result<Vec<String>> {
        let (kind, id) = recipient_parts(recipient);
        let rows = sqlx::query(
            r#"
            SELECT token FROM device_tokens
            WHERE recipient_kind = $1 AND recipient_id = $2
            ORDER BY created_at, token
            "#,
        )
        .bind(kind)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("token")?))
            .collect()
    }

    async fn remove_device_tokens(
        &self,
        recipient: &Recipient,
        tokens: &[String],
    ) -> Result<usize> {
        let (kind, id) = recipient_parts(recipient);
        let removed = sqlx::query(
            r#"
            DELETE FROM device_tokens
            WHERE recipient_kind = $1 AND recipient_id = $2 AND token = ANY($3)
            "#,
        )
        .bind(kind)
        .bind(id)
        .bind(tokens)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed as usize)
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    #[tracing::instrument(skip(self, request), fields(request_id = %request.id))]
    async fn create_request(&self, request: &ServiceRequest) -> Result<()> {
        let estimate = request.price_estimate;
        sqlx::query(
            r#"
            INSERT INTO service_requests (
                id, owner_id, service_category, description, price_min, price_max,
                price_confidence, matched_provider_ids, status, assigned_provider_id,
                selected_bid_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(*request.id)
        .bind(request.owner_id.as_str())
        .bind(&request.service_category)
        .bind(&request.description)
        .bind(estimate.map(|e| e.min))
        .bind(estimate.map(|e| e.max))
        .bind(estimate.and_then(|e| e.confidence))
        .bind(provider_vec(&request.matched_provider_ids))
        .bind(request.status.as_str())
        .bind(request.assigned_provider_id.as_ref().map(|p| p.0.clone()))
        .bind(request.selected_bid_id.map(|b| b.0))
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                GavelError::Validation(format!("request {} already exists", request.id))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<ServiceRequest> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM service_requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(GavelError::RequestNotFound(id))?;
        request_from_row(&row)
    }

    #[tracing::instrument(skip(self, mutation), fields(request_id = %id, expected = %expected, target = %mutation.target()))]
    async fn transition_request(
        &self,
        id: RequestId,
        expected: RequestStatus,
        mutation: &RequestMutation,
    ) -> Result<bool> {
        let now = self.now();
        let query = match mutation {
            RequestMutation::Match { provider_ids } => sqlx::query(
                r#"
                UPDATE service_requests
                SET status = 'matched', matched_provider_ids = $3, updated_at = $4
                WHERE id = $1 AND status = $2
                "#,
            )
            .bind(*id)
            .bind(expected.as_str())
            .bind(provider_vec(provider_ids))
            .bind(now),
            RequestMutation::StartBidding => sqlx::query(
                r#"
                UPDATE service_requests
                SET status = 'bidding', updated_at = $3
                WHERE id = $1 AND status = $2
                "#,
            )
            .bind(*id)
            .bind(expected.as_str())
            .bind(now),
            RequestMutation::Assign {
                provider_id,
                bid_id,
            } => sqlx::query(
                r#"
                UPDATE service_requests
                SET status = 'assigned', assigned_provider_id = $3, selected_bid_id = $4,
                    updated_at = $5
                WHERE id = $1 AND status = $2
                "#,
            )
            .bind(*id)
            .bind(expected.as_str())
            .bind(provider_id.as_str())
            .bind(bid_id.0)
            .bind(now),
        };

        let rows_affected = query.execute(&self.pool).await?.rows_affected();
        if rows_affected == 0 {
            if !self.request_exists(id).await? {
                return Err(GavelError::RequestNotFound(id));
            }
            return Ok(false);
        }
        Ok(true)
    }

    #[tracing::instrument(skip(self, session), fields(request_id = %session.data.request_id, session_id = %session.data.id))]
    async fn open_session(&self, session: &BiddingSession<Active>) -> Result<()> {
        let data = &session.data;
        let received: Vec<Uuid> = data.received_bid_ids.iter().map(|b| b.0).collect();
        sqlx::query(
            r#"
            INSERT INTO bidding_sessions (
                id, request_id, owner_id, notified_provider_ids, received_bid_ids, max_bids,
                status, created_at, deadline
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $8)
            "#,
        )
        .bind(*data.id)
        .bind(*data.request_id)
        .bind(data.owner_id.as_str())
        .bind(provider_vec(&data.notified_provider_ids))
        .bind(received)
        .bind(data.max_bids.min(i32::MAX as u32) as i32)
        .bind(data.created_at)
        .bind(data.deadline)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                GavelError::DuplicateSession(data.request_id)
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<AnySession> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM bidding_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| GavelError::SessionNotFound(id.0.to_string()))?;
        session_from_row(&row)
    }

    async fn find_active_session(
        &self,
        request_id: RequestId,
    ) -> Result<Option<BiddingSession<Active>>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM bidding_sessions WHERE request_id = $1 AND status = 'active'",
            SESSION_COLUMNS
        ))
        .bind(*request_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(session_from_row(&row)?.into_active()),
            None => Ok(None),
        }
    }

    async fn list_sessions(&self, request_id: RequestId) -> Result<Vec<AnySession>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM bidding_sessions WHERE request_id = $1 ORDER BY created_at, id",
            SESSION_COLUMNS
        ))
        .bind(*request_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn append_session_bid(&self, session_id: SessionId, bid_id: BidId) -> Result<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE bidding_sessions
            SET received_bid_ids = array_append(received_bid_ids, $2)
            WHERE id = $1 AND status = 'active' AND NOT ($2 = ANY(received_bid_ids))
            "#,
        )
        .bind(*session_id)
        .bind(*bid_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Either already present (fine) or the session is gone/completed
            match self.get_session(session_id).await? {
                AnySession::Active(_) => {}
                AnySession::Completed(_) => return Err(GavelError::AlreadyCompleted(session_id)),
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(session_id = %session_id, bid_id = %selected_bid_id))]
    async fn complete_session(
        &self,
        session_id: SessionId,
        selected_bid_id: BidId,
        winning_provider_id: &ProviderId,
    ) -> Result<BiddingSession<Completed>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE bidding_sessions
            SET status = 'completed', completed_at = $2, selected_bid_id = $3,
                winning_provider_id = $4
            WHERE id = $1 AND status = 'active'
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(*session_id)
        .bind(self.now())
        .bind(*selected_bid_id)
        .bind(winning_provider_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => match session_from_row(&row)? {
                AnySession::Completed(session) => Ok(session),
                AnySession::Active(_) => Err(GavelError::Other(anyhow!(
                    "session {} still active after completion",
                    session_id
                ))),
            },
            None => {
                // Distinguish missing from already completed
                self.get_session(session_id).await?;
                Err(GavelError::AlreadyCompleted(session_id))
            }
        }
    }

    #[tracing::instrument(skip(self, bid), fields(request_id = %bid.request_id, provider_id = %bid.provider_id, bid_id = %bid.id, session_id = %session_id))]
    async fn insert_bid(&self, bid: &Bid, session_id: SessionId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // A share lock holds off `apply_resolution`, which locks the same row
        // for update, until this bid is committed or rolled back. Early
        // returns drop `tx`, which rolls it back.
        let status: String =
            sqlx::query_scalar("SELECT status FROM service_requests WHERE id = $1 FOR SHARE")
                .bind(*bid.request_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(GavelError::RequestNotFound(bid.request_id))?;
        let status: RequestStatus = parse(&status)?;
        if !status.accepts_bids() {
            return Err(GavelError::BiddingClosed(bid.request_id, status));
        }

        let session = sqlx::query(
            r#"
            SELECT request_id, status, max_bids, cardinality(received_bid_ids) AS received
            FROM bidding_sessions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(*session_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| GavelError::SessionNotFound(session_id.0.to_string()))?;

        if session.try_get::<Uuid, _>("request_id")? != *bid.request_id {
            return Err(GavelError::SessionNotFound(session_id.0.to_string()));
        }
        if session.try_get::<&str, _>("status")? != SessionStatus::Active.as_str() {
            return Err(GavelError::AlreadyCompleted(session_id));
        }
        let max_bids: i32 = session.try_get("max_bids")?;
        let received: i32 = session.try_get("received")?;
        if received >= max_bids {
            return Err(GavelError::SessionFull(session_id, max_bids.max(0) as u32));
        }

        sqlx::query(
            r#"
            INSERT INTO bids (
                id, request_id, provider_id, owner_id, price_quote, availability, message,
                status, rejection_reason, created_at, expires_at, price_benchmark,
                is_ai_generated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(*bid.id)
        .bind(*bid.request_id)
        .bind(bid.provider_id.as_str())
        .bind(bid.owner_id.as_str())
        .bind(bid.price_quote)
        .bind(&bid.availability)
        .bind(&bid.message)
        .bind(bid.status.as_str())
        .bind(&bid.rejection_reason)
        .bind(bid.created_at)
        .bind(bid.expires_at)
        .bind(bid.price_benchmark.as_str())
        .bind(bid.is_ai_generated)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                GavelError::DuplicateBid(bid.request_id, bid.provider_id.clone())
            } else {
                e.into()
            }
        })?;

        sqlx::query(
            r#"
            UPDATE bidding_sessions
            SET received_bid_ids = array_append(received_bid_ids, $2)
            WHERE id = $1 AND NOT ($2 = ANY(received_bid_ids))
            "#,
        )
        .bind(*session_id)
        .bind(*bid.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_bid(&self, id: BidId) -> Result<Bid> {
        let row = sqlx::query(&format!("SELECT {} FROM bids WHERE id = $1", BID_COLUMNS))
            .bind(*id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(GavelError::BidNotFound(id))?;
        bid_from_row(&row)
    }

    async fn list_bids(&self, request_id: RequestId) -> Result<Vec<Bid>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM bids WHERE request_id = $1 ORDER BY created_at, id",
            BID_COLUMNS
        ))
        .bind(*request_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bid_from_row).collect()
    }

    async fn count_bids(&self, request_id: RequestId) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bids WHERE request_id = $1")
            .bind(*request_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    #[tracing::instrument(skip(self, resolution), fields(request_id = %resolution.request_id, steps = resolution.steps.len()))]
    async fn apply_resolution(&self, resolution: &Resolution) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Serialize resolutions of the same request
        sqlx::query("SELECT id FROM service_requests WHERE id = $1 FOR UPDATE")
            .bind(*resolution.request_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(GavelError::RequestNotFound(resolution.request_id))?;

        // A bid committed after the batch was planned would stay pending
        let pending: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM bids WHERE request_id = $1 AND status = 'pending'",
        )
        .bind(*resolution.request_id)
        .fetch_all(&mut *tx)
        .await?;
        let covered = resolution.bid_ids();
        if let Some(stray) = pending.into_iter().map(BidId).find(|id| !covered.contains(id)) {
            tx.rollback().await?;
            return Err(GavelError::StaleResolution(
                resolution.request_id,
                format!("bid {} is pending but not part of the resolution", stray),
            ));
        }

        for step in &resolution.steps {
            let query = match step {
                ResolutionStep::AcceptBid { bid_id } => sqlx::query(
                    "UPDATE bids SET status = 'accepted' WHERE id = $1 AND status = 'pending'",
                )
                .bind(**bid_id),
                ResolutionStep::RejectBid { bid_id, reason } => sqlx::query(
                    r#"
                    UPDATE bids SET status = 'rejected', rejection_reason = $2
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(**bid_id)
                .bind(reason.as_str()),
                ResolutionStep::CompleteSession {
                    session_id,
                    selected_bid_id,
                    winning_provider_id,
                } => sqlx::query(
                    r#"
                    UPDATE bidding_sessions
                    SET status = 'completed', completed_at = $2, selected_bid_id = $3,
                        winning_provider_id = $4
                    WHERE id = $1 AND status = 'active'
                    "#,
                )
                .bind(**session_id)
                .bind(resolution.at)
                .bind(**selected_bid_id)
                .bind(winning_provider_id.as_str()),
                ResolutionStep::AssignRequest {
                    request_id,
                    expected,
                    provider_id,
                    bid_id,
                } => sqlx::query(
                    r#"
                    UPDATE service_requests
                    SET status = 'assigned', assigned_provider_id = $3, selected_bid_id = $4,
                        updated_at = $5
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(**request_id)
                .bind(expected.as_str())
                .bind(provider_id.as_str())
                .bind(**bid_id)
                .bind(resolution.at),
            };

            let rows_affected = query.execute(&mut *tx).await?.rows_affected();
            if rows_affected == 0 {
                tx.rollback().await?;
                tracing::debug!(?step, "Resolution precondition failed, rolled back");
                return Err(GavelError::StaleResolution(
                    resolution.request_id,
                    format!("precondition failed for {:?}", step),
                ));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_provider(&self, provider: &Provider) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO providers (id, company_name, status, previous_status, status_updated_at, reviewed_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET company_name = EXCLUDED.company_name
            "#,
        )
        .bind(provider.id.as_str())
        .bind(&provider.company_name)
        .bind(provider.status.as_str())
        .bind(provider.previous_status.map(|s| s.as_str()))
        .bind(provider.status_updated_at)
        .bind(&provider.reviewed_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_provider(&self, id: &ProviderId) -> Result<Provider> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM providers WHERE id = $1",
            PROVIDER_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| GavelError::ProviderNotFound(id.clone()))?;
        provider_from_row(&row)
    }

    #[tracing::instrument(skip(self, change), fields(provider_id = %id, new_status = %change.new_status))]
    async fn update_provider_status(
        &self,
        id: &ProviderId,
        change: &ProviderStatusChange,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE providers
            SET status = $3, previous_status = status, status_updated_at = $4, reviewed_by = $5
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.as_str())
        .bind(change.expected.as_str())
        .bind(change.new_status.as_str())
        .bind(change.at)
        .bind(&change.reviewed_by)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            self.get_provider(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn list_providers(&self, status: Option<ProviderStatus>) -> Result<Vec<Provider>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM providers WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY id",
            PROVIDER_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(provider_from_row).collect()
    }

    async fn record_notification(&self, record: &NotificationRecord) -> Result<()> {
        let (kind, id) = recipient_parts(&record.recipient);
        sqlx::query(
            r#"
            INSERT INTO notification_log (
                id, recipient_kind, recipient_id, kind, title, body, request_id, delivered,
                recipient_invalid, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(kind)
        .bind(id)
        .bind(record.kind.as_str())
        .bind(&record.title)
        .bind(&record.body)
        .bind(record.request_id.map(|r| r.0))
        .bind(record.delivered)
        .bind(record.recipient_invalid)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_notifications(&self, recipient: &Recipient) -> Result<Vec<NotificationRecord>> {
        let (kind, id) = recipient_parts(recipient);
        let rows = sqlx::query(
            r#"
            SELECT id, recipient_kind, recipient_id, kind, title, body, request_id, delivered,
                   recipient_invalid, created_at
            FROM notification_log
            WHERE recipient_kind = $1 AND recipient_id = $2
            ORDER BY created_at, id
            "#,
        )
        .bind(kind)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }
}
