//! HTTP operation surface.
//!
//! - `POST /requests` - create a request (the matching process)
//! - `GET  /requests/:id` - request status
//! - `GET  /requests/:id/bids` - bids on a request
//! - `POST /requests/:id/matched` - "request matched" trigger
//! - `POST /sessions` - open a bidding session for a matched request
//! - `POST /bids` - submit a bid
//! - `POST /bids/:id/accept` - accept a bid (owner id in the body)
//! - `POST /providers` - register a provider
//! - `POST /providers/:id/status` - review a provider
//! - `POST /devices` - register a device token
//! - `GET  /health` - liveness
//!
//! Successes answer 200. Errors are returned as
//! `{"error": message, "code": kind}` with the status code given by
//! [`GavelError::status_code`]; malformed bodies and path ids answer 400.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::bid::{Bid, BidId, SubmitBid};
use crate::domain::notification::Recipient;
use crate::domain::provider::{Provider, ProviderId, ProviderStatus};
use crate::domain::request::{PriceEstimate, RequestId, ServiceRequest, UserId};
use crate::error::{ErrorKind, GavelError};
use crate::manager::{
    AcceptOutcome, BidReceipt, BiddingManager, OpenSession, ProviderStatusUpdate, SessionOpened,
};
use crate::notify::Notifier;
use crate::storage::Storage;

/// The manager as shared by every handler.
pub type SharedManager = BiddingManager<dyn Storage, dyn Notifier>;

/// Build the router.
pub fn router(manager: SharedManager) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/requests", post(create_request))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/bids", get(list_bids))
        .route("/requests/:id/matched", post(request_matched))
        .route("/sessions", post(open_session))
        .route("/bids", post(submit_bid))
        .route("/bids/:id/accept", post(accept_bid))
        .route("/providers", post(register_provider))
        .route("/providers/:id/status", post(update_provider_status))
        .route("/devices", post(register_device))
        .with_state(manager)
}

/// Convenience for callers holding concrete types.
pub fn shared<S, N>(storage: Arc<S>, notifier: Arc<N>) -> SharedManager
where
    S: Storage + 'static,
    N: Notifier + 'static,
{
    let storage: Arc<dyn Storage> = storage;
    let notifier: Arc<dyn Notifier> = notifier;
    BiddingManager::new(storage, notifier)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl From<GavelError> for ApiError {
    fn from(e: GavelError) -> Self {
        let kind = e.kind();
        let status =
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = if kind == ErrorKind::Internal {
            tracing::error!(error = %e, "Internal error");
            "An internal error occurred".to_string()
        } else {
            e.to_string()
        };
        Self {
            status,
            code: kind.as_str(),
            message,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ErrorKind::Validation.as_str(),
            message: rejection.body_text(),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ErrorKind::Validation.as_str(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(
                status = %self.status,
                code = self.code,
                message = %self.message,
                "Request failed"
            );
        }
        let body = ErrorBody {
            error: self.message,
            code: self.code.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

/// JSON body whose rejections (malformed JSON, wrong types, missing fields)
/// all answer 400.
pub struct JsonBody<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(JsonBody(value))
    }
}

/// Path parameters, rejected with the same JSON error body as [`JsonBody`].
pub struct PathParam<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for PathParam<T>
where
    Path<T>: FromRequestParts<S, Rejection = PathRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(PathParam(value))
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub owner_id: String,
    pub service_category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub price_estimate: Option<PriceEstimate>,
}

#[derive(Debug, Deserialize)]
pub struct RequestMatchedBody {
    pub provider_ids: BTreeSet<ProviderId>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct AcceptBidBody {
    pub owner_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterProviderBody {
    pub id: String,
    #[serde(default)]
    pub company_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ProviderStatusBody {
    pub status: ProviderStatus,
    #[serde(default)]
    pub reviewed_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceBody {
    pub recipient: Recipient,
    pub token: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn create_request(
    State(manager): State<SharedManager>,
    JsonBody(body): JsonBody<CreateRequestBody>,
) -> ApiResult<Json<ServiceRequest>> {
    if body.owner_id.trim().is_empty() || body.service_category.trim().is_empty() {
        return Err(GavelError::Validation(
            "owner_id and service_category are required".to_string(),
        )
        .into());
    }
    let storage = manager.storage();
    let mut request = ServiceRequest::new(
        UserId(body.owner_id),
        body.service_category,
        body.description,
        storage.now(),
    );
    request.price_estimate = body.price_estimate;
    storage.create_request(&request).await?;
    Ok(Json(request))
}

async fn get_request(
    State(manager): State<SharedManager>,
    PathParam(id): PathParam<Uuid>,
) -> ApiResult<Json<ServiceRequest>> {
    Ok(Json(manager.get_request(RequestId(id)).await?))
}

async fn list_bids(
    State(manager): State<SharedManager>,
    PathParam(id): PathParam<Uuid>,
) -> ApiResult<Json<Vec<Bid>>> {
    Ok(Json(manager.list_bids(RequestId(id)).await?))
}

async fn request_matched(
    State(manager): State<SharedManager>,
    PathParam(id): PathParam<Uuid>,
    JsonBody(body): JsonBody<RequestMatchedBody>,
) -> ApiResult<Json<SessionOpened>> {
    let opened = manager
        .on_request_matched(RequestId(id), body.provider_ids, body.deadline)
        .await?;
    Ok(Json(opened))
}

async fn open_session(
    State(manager): State<SharedManager>,
    JsonBody(body): JsonBody<OpenSession>,
) -> ApiResult<Json<SessionOpened>> {
    let opened = manager.open_bidding_session(body).await?;
    Ok(Json(opened))
}

async fn submit_bid(
    State(manager): State<SharedManager>,
    JsonBody(body): JsonBody<SubmitBid>,
) -> ApiResult<Json<BidReceipt>> {
    let receipt = manager.submit_bid(body).await?;
    Ok(Json(receipt))
}

async fn accept_bid(
    State(manager): State<SharedManager>,
    PathParam(id): PathParam<Uuid>,
    JsonBody(body): JsonBody<AcceptBidBody>,
) -> ApiResult<Json<AcceptOutcome>> {
    let outcome = manager
        .accept_bid(BidId(id), &UserId(body.owner_id))
        .await?;
    Ok(Json(outcome))
}

async fn register_provider(
    State(manager): State<SharedManager>,
    JsonBody(body): JsonBody<RegisterProviderBody>,
) -> ApiResult<Json<Provider>> {
    let provider = manager
        .register_provider(Provider::new(ProviderId(body.id), body.company_name))
        .await?;
    Ok(Json(provider))
}

async fn update_provider_status(
    State(manager): State<SharedManager>,
    PathParam(id): PathParam<String>,
    JsonBody(body): JsonBody<ProviderStatusBody>,
) -> ApiResult<Json<ProviderStatusUpdate>> {
    let update = manager
        .update_provider_status(&ProviderId(id), body.status, body.reviewed_by)
        .await?;
    Ok(Json(update))
}

async fn register_device(
    State(manager): State<SharedManager>,
    JsonBody(body): JsonBody<RegisterDeviceBody>,
) -> ApiResult<StatusCode> {
    manager
        .register_device_token(&body.recipient, &body.token)
        .await?;
    Ok(StatusCode::OK)
}
