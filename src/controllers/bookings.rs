use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppResult;
use crate::middleware::AuthUser;
use crate::models::BookingStatus;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", get(list_bookings).post(create_booking))
        .route("/bookings/{id}", get(get_booking).patch(update_booking))
        .route("/bookings/{id}/cancel", patch(cancel_booking))
        .route("/bookings/{id}/status", patch(set_status))
}

#[derive(Debug, Deserialize)]
struct CreateBookingRequest {
    show_id: Uuid,
    seats: Vec<String>,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateBookingRequest>,
) -> AppResult<impl IntoResponse> {
    let booking = state
        .bookings
        .create_booking(&user.caller(), req.show_id, &req.seats)
        .await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

async fn list_bookings(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> AppResult<impl IntoResponse> {
    let bookings = state.bookings.list_bookings(&user.caller()).await?;
    Ok(Json(bookings))
}

async fn get_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let booking = state.bookings.get_booking(&user.caller(), id).await?;
    Ok(Json(booking))
}

#[derive(Debug, Deserialize)]
struct UpdateBookingRequest {
    status: Option<BookingStatus>,
    seats: Option<Vec<String>>,
}

async fn update_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateBookingRequest>,
) -> AppResult<impl IntoResponse> {
    let booking = state
        .bookings
        .update_booking(&user.caller(), id, req.status, req.seats)
        .await?;
    Ok(Json(booking))
}

async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    state.bookings.cancel_booking(&user.caller(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct SetStatusRequest {
    status: BookingStatus,
}

async fn set_status(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<SetStatusRequest>,
) -> AppResult<impl IntoResponse> {
    state.bookings.set_status(&user.caller(), id, req.status).await?;
    Ok(StatusCode::NO_CONTENT)
}
