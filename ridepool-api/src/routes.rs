use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

use ridepool_booking::Availability;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub date: NaiveDate,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/routes/{route_id}/availability", get(get_availability))
        .route("/v1/routes/{route_id}/capacity/invalidate", post(invalidate_capacity))
}

/// GET /v1/routes/{route_id}/availability?date=YYYY-MM-DD
async fn get_availability(
    State(state): State<AppState>,
    Path(route_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<Availability>, AppError> {
    Ok(Json(state.bookings.get_availability(route_id, query.date).await?))
}

/// POST /v1/routes/{route_id}/capacity/invalidate
/// Called by the route service after a vehicle change
async fn invalidate_capacity(State(state): State<AppState>, Path(route_id): Path<Uuid>) -> StatusCode {
    state.capacity.invalidate(route_id).await;
    StatusCode::NO_CONTENT
}
