use axum::{extract::State, routing::post, Json, Router};

use ridepool_core::payment::PaymentSignal;
use ridepool_core::Booking;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/webhooks/payments", post(handle_payment_signal))
}

/// POST /v1/webhooks/payments
/// Payment service callbacks. Safe to redeliver.
async fn handle_payment_signal(
    State(state): State<AppState>,
    Json(signal): Json<PaymentSignal>,
) -> Result<Json<Booking>, AppError> {
    let booking = match signal {
        PaymentSignal::PaymentConfirmed { booking_id, payment_id } => {
            tracing::info!("Received payment {} for booking {}", payment_id, booking_id);
            state.bookings.handle_payment_confirmed(booking_id, &payment_id).await?
        }
        PaymentSignal::ExtendHold { booking_id } => {
            tracing::info!("Payment attempt started for booking {}", booking_id);
            state.bookings.extend_hold(booking_id).await?
        }
    };
    Ok(Json(booking))
}
