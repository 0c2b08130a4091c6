use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppResult;
use crate::middleware::AuthUser;
use crate::models::PaymentMethod;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/payments", post(create_payment))
        .route("/payments/{id}", get(get_payment))
        .route("/payment/ipn", get(handle_ipn))
}

#[derive(Debug, Deserialize)]
struct CreatePaymentRequest {
    booking_id: Uuid,
    method: PaymentMethod,
    bank_code: Option<String>,
}

fn client_ip(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("127.0.0.1")
}

async fn create_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    headers: HeaderMap,
    Json(req): Json<CreatePaymentRequest>,
) -> AppResult<impl IntoResponse> {
    let payment = state
        .payments
        .create_payment(
            &user.caller(),
            req.booking_id,
            req.method,
            req.bank_code.as_deref(),
            client_ip(&headers),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

async fn get_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let payment = state.payments.get_payment(&user.caller(), id).await?;
    Ok(Json(payment))
}

/// Provider webhook. Unauthenticated by design; trust comes from the
/// signature inside the payload. The provider expects HTTP 200 with a
/// response code in the body for every delivery, including rejected ones.
async fn handle_ipn(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BTreeMap<String, String>>,
) -> impl IntoResponse {
    Json(state.settlement.process(params).await)
}
