use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::booking::{Booking, BookingStatus};
use crate::CoreResult;

/// Published after every booking status change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingEvent {
    pub booking_id: Uuid,
    pub route_id: Uuid,
    pub travel_date: NaiveDate,
    pub status: BookingStatus,
    pub seat_numbers: Vec<i32>,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl BookingEvent {
    pub fn from_booking(booking: &Booking) -> Self {
        let reason = booking
            .cancellation_reason
            .clone()
            .or_else(|| booking.failure_reason.clone());

        Self {
            booking_id: booking.id,
            route_id: booking.route_id,
            travel_date: booking.travel_date,
            status: booking.status,
            seat_numbers: booking.seat_numbers.clone(),
            reason,
            occurred_at: booking.updated_at,
        }
    }

    /// e.g. `booking.checked_in`
    pub fn topic(&self) -> String {
        format!("booking.{}", self.status.as_str().to_lowercase())
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &BookingEvent) -> CoreResult<()>;
}
