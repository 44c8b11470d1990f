//! Ingress HTTP layer (spec.md §6, ingress table): thin axum handlers over
//! the core [`crate::store::LedgerStore`] and [`crate::luhn`]/[`crate::auth`]
//! primitives. Status codes follow the ingress table exactly, including the
//! "200, not an error" resubmission-by-the-same-user path (spec.md §7).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::auth::{self, AuthUserId};
use crate::config::Config;
use crate::domain::{AddOrderOutcome, OrderFilter, Role};
use crate::error::{parse_json, ApiError};
use crate::luhn;
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/orders", post(submit_order).get(list_orders))
        .route("/balance", get(get_balance))
        .route("/balance/withdraw", post(withdraw))
        .route("/withdrawals", get(list_withdrawals))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    let public = Router::new().route("/register", post(register)).route("/login", post(login));

    Router::new()
        .nest("/api/user", public.merge(authenticated))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct Credentials {
    login: String,
    password: String,
}

async fn register(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let body: Credentials = parse_json(&body)?;
    let password_hash = auth::hash_password(&body.password).map_err(ApiError::Internal)?;
    let user_id = state.store.add_user(&body.login, &password_hash, Role::User).await?;
    issue_token(&state, user_id)
}

async fn login(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let body: Credentials = parse_json(&body)?;
    let user = state.store.get_user_by_login(&body.login).await?.ok_or(ApiError::BadCredentials)?;
    if !auth::verify_password(&body.password, &user.password_hash) {
        return Err(ApiError::BadCredentials);
    }
    issue_token(&state, user.id)
}

fn issue_token(state: &AppState, user_id: i64) -> Result<Response, ApiError> {
    let token = auth::mint_token(user_id, &state.config.jwt_key, state.config.jwt_expiration).map_err(ApiError::Internal)?;
    let mut response = StatusCode::OK.into_response();
    let header_value = format!("Bearer {token}")
        .parse()
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("invalid token header: {e}")))?;
    response.headers_mut().insert(header::AUTHORIZATION, header_value);
    Ok(response)
}

async fn submit_order(
    State(state): State<AppState>,
    Extension(AuthUserId(user_id)): Extension<AuthUserId>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default();
    if !content_type.starts_with("text/plain") {
        return Err(ApiError::WrongContentType);
    }

    let number = body.trim();
    if !luhn::is_valid(number) {
        return Err(ApiError::InvalidOrderNumber);
    }

    match state.store.add_order(number, user_id).await? {
        AddOrderOutcome::Created(_) => Ok(StatusCode::ACCEPTED),
        AddOrderOutcome::AlreadyByThisUser(_) => Ok(StatusCode::OK),
        AddOrderOutcome::AlreadyByOtherUser(_) => Err(ApiError::OrderOwnedByAnother),
    }
}

#[derive(Debug, Serialize)]
struct OrderView {
    number: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    accrual: Option<Decimal>,
    uploaded_at: chrono::DateTime<chrono::Utc>,
}

async fn list_orders(
    State(state): State<AppState>,
    Extension(AuthUserId(user_id)): Extension<AuthUserId>,
) -> Result<Response, ApiError> {
    let mut orders = state.store.get_orders(OrderFilter::ByUser(user_id)).await?;
    orders.sort_by_key(|o| std::cmp::Reverse(o.uploaded_at));

    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let views: Vec<OrderView> = orders
        .into_iter()
        .map(|o| OrderView { number: o.number, status: o.status.as_str(), accrual: o.accrual, uploaded_at: o.uploaded_at })
        .collect();
    Ok(Json(views).into_response())
}

async fn get_balance(
    State(state): State<AppState>,
    Extension(AuthUserId(user_id)): Extension<AuthUserId>,
) -> Result<Response, ApiError> {
    let balance = state.store.get_balance(user_id).await?;
    Ok(Json(balance).into_response())
}

#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    order: String,
    sum: Decimal,
}

async fn withdraw(
    State(state): State<AppState>,
    Extension(AuthUserId(user_id)): Extension<AuthUserId>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let body: WithdrawRequest = parse_json(&body)?;
    if !luhn::is_valid(&body.order) {
        return Err(ApiError::InvalidOrderNumber);
    }

    state.store.withdraw_bonuses(user_id, &body.order, body.sum).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct WithdrawalView {
    order: String,
    sum: Decimal,
    processed_at: chrono::DateTime<chrono::Utc>,
}

async fn list_withdrawals(
    State(state): State<AppState>,
    Extension(AuthUserId(user_id)): Extension<AuthUserId>,
) -> Result<Response, ApiError> {
    let mut withdrawals = state.store.get_withdrawals(user_id).await?;
    withdrawals.sort_by_key(|w| std::cmp::Reverse(w.processed_at));

    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let views: Vec<WithdrawalView> = withdrawals
        .into_iter()
        .map(|w| WithdrawalView { order: w.order_number, sum: w.sum, processed_at: w.processed_at })
        .collect();
    Ok(Json(views).into_response())
}
