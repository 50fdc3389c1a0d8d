use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use ridepool_core::{Booking, CoreError, ReserveSeats};

use crate::error::AppError;
use crate::state::AppState;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub rider_id: String,
    pub route_id: Uuid,
    pub travel_date: NaiveDate,
    pub seat_count: i32,
    #[serde(default)]
    pub seat_numbers: Option<Vec<i32>>,
    /// Falls back to the `Idempotency-Key` header.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings", post(create_booking))
        .route("/v1/bookings/{id}", get(get_booking))
        .route("/v1/bookings/{id}/cancel", post(cancel_booking))
        .route("/v1/bookings/{id}/check-in", post(check_in))
        .route("/v1/bookings/{id}/complete", post(complete))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/bookings
/// Reserve seats; replays with the same idempotency key return the same booking
async fn create_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<Booking>), AppError> {
    let header_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let idempotency_key = payload
        .idempotency_key
        .or(header_key)
        .ok_or_else(|| CoreError::ValidationError("idempotency key is required".to_string()))?;

    let request = ReserveSeats {
        rider_id: payload.rider_id,
        route_id: payload.route_id,
        travel_date: payload.travel_date,
        seat_count: payload.seat_count,
        seat_numbers: payload.seat_numbers,
        idempotency_key,
    };

    let booking = state.bookings.reserve_seats(request).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// GET /v1/bookings/{id}
async fn get_booking(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.bookings.get_booking(id).await?))
}

/// POST /v1/bookings/{id}/cancel
async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Booking>, AppError> {
    let reason = payload.reason.unwrap_or_else(|| "cancelled by rider".to_string());
    Ok(Json(state.bookings.cancel_booking(id, &reason).await?))
}

/// POST /v1/bookings/{id}/check-in
async fn check_in(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.bookings.check_in(id).await?))
}

/// POST /v1/bookings/{id}/complete
async fn complete(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.bookings.complete(id).await?))
}
