use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CoreError, CoreResult};

/// Booking status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Held,
    Paid,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Held => "HELD",
            BookingStatus::Paid => "PAID",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::CheckedIn => "CHECKED_IN",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Expired => "EXPIRED",
            BookingStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::Cancelled
                | BookingStatus::Expired
                | BookingStatus::Failed
        )
    }

    /// Statuses whose seats are owned by the durable booking row itself.
    pub fn occupies_seats(&self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::CheckedIn)
    }

    /// Statuses whose seats live in the hold store rather than the booking row.
    pub fn has_live_hold(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Held | BookingStatus::Paid
        )
    }

    /// Statuses for which money has (or may have) been taken.
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            BookingStatus::Paid | BookingStatus::Confirmed | BookingStatus::CheckedIn
        )
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;

        if self.is_terminal() {
            return false;
        }

        match next {
            Cancelled | Expired => true,
            Held => *self == Pending,
            Failed => matches!(self, Pending | Held),
            Paid => *self == Held,
            Confirmed => *self == Paid,
            CheckedIn => *self == Confirmed,
            Completed => *self == CheckedIn,
            Pending => false,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "PENDING" => BookingStatus::Pending,
            "HELD" => BookingStatus::Held,
            "PAID" => BookingStatus::Paid,
            "CONFIRMED" => BookingStatus::Confirmed,
            "CHECKED_IN" => BookingStatus::CheckedIn,
            "COMPLETED" => BookingStatus::Completed,
            "CANCELLED" => BookingStatus::Cancelled,
            "EXPIRED" => BookingStatus::Expired,
            "FAILED" => BookingStatus::Failed,
            other => {
                return Err(CoreError::InternalError(format!(
                    "Unknown booking status: {}",
                    other
                )))
            }
        };
        Ok(status)
    }
}

/// The durable record of a reservation attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub rider_id: String,
    pub route_id: Uuid,
    pub travel_date: NaiveDate,
    pub seat_count: i32,
    pub seat_numbers: Vec<i32>,
    pub status: BookingStatus,
    pub idempotency_key: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub payment_id: Option<String>,
    pub failure_reason: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub held_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Booking {
    pub fn new_pending(request: &ReserveSeats, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rider_id: request.rider_id.clone(),
            route_id: request.route_id,
            travel_date: request.travel_date,
            seat_count: request.seat_count,
            seat_numbers: Vec::new(),
            status: BookingStatus::Pending,
            idempotency_key: request.idempotency_key.clone(),
            expires_at: Some(expires_at),
            payment_id: None,
            failure_reason: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
            held_at: None,
            paid_at: None,
            confirmed_at: None,
            checked_in_at: None,
            completed_at: None,
            cancelled_at: None,
            expired_at: None,
            failed_at: None,
        }
    }

    /// Apply a status change and stamp the matching transition timestamp.
    ///
    /// Returns `InvalidTransition` without touching the booking when the
    /// state machine does not allow the move.
    pub fn transition(&mut self, next: BookingStatus, now: DateTime<Utc>) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        match next {
            BookingStatus::Held => self.held_at = Some(now),
            BookingStatus::Paid => self.paid_at = Some(now),
            BookingStatus::Confirmed => {
                self.confirmed_at = Some(now);
                self.expires_at = None;
            }
            BookingStatus::CheckedIn => self.checked_in_at = Some(now),
            BookingStatus::Completed => self.completed_at = Some(now),
            BookingStatus::Cancelled => self.cancelled_at = Some(now),
            BookingStatus::Expired => self.expired_at = Some(now),
            BookingStatus::Failed => self.failed_at = Some(now),
            BookingStatus::Pending => {}
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_hold_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Client request to reserve seats on a route for one travel date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveSeats {
    pub rider_id: String,
    pub route_id: Uuid,
    pub travel_date: NaiveDate,
    pub seat_count: i32,
    /// Specific seats, when the rider picked them. Otherwise the lowest free
    /// seat numbers are assigned.
    #[serde(default)]
    pub seat_numbers: Option<Vec<i32>>,
    pub idempotency_key: String,
}

impl ReserveSeats {
    pub fn validate(&self) -> CoreResult<()> {
        if self.idempotency_key.trim().is_empty() {
            return Err(CoreError::ValidationError("idempotency_key is required".to_string()));
        }
        if self.rider_id.trim().is_empty() {
            return Err(CoreError::ValidationError("rider_id is required".to_string()));
        }
        if self.seat_count <= 0 {
            return Err(CoreError::ValidationError(format!(
                "seat_count must be positive, got {}",
                self.seat_count
            )));
        }

        if let Some(seats) = &self.seat_numbers {
            if seats.len() != self.seat_count as usize {
                return Err(CoreError::ValidationError(format!(
                    "seat_count is {} but {} seat numbers were given",
                    self.seat_count,
                    seats.len()
                )));
            }
            validate_seat_numbers(seats)?;
        }

        Ok(())
    }
}

/// Seat numbers must be positive and distinct.
pub fn validate_seat_numbers(seats: &[i32]) -> CoreResult<()> {
    if seats.is_empty() {
        return Err(CoreError::ValidationError("at least one seat is required".to_string()));
    }
    if let Some(bad) = seats.iter().find(|s| **s <= 0) {
        return Err(CoreError::ValidationError(format!("invalid seat number {}", bad)));
    }
    let distinct: BTreeSet<i32> = seats.iter().copied().collect();
    if distinct.len() != seats.len() {
        return Err(CoreError::ValidationError("duplicate seat numbers".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request() -> ReserveSeats {
        ReserveSeats {
            rider_id: "rider-1".to_string(),
            route_id: Uuid::new_v4(),
            travel_date: NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
            seat_count: 2,
            seat_numbers: None,
            idempotency_key: "key-1".to_string(),
        }
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let now = Utc::now();
        let mut booking = Booking::new_pending(&request(), now, now + Duration::minutes(10));

        booking.transition(BookingStatus::Held, now).unwrap();
        booking.transition(BookingStatus::Paid, now).unwrap();
        booking.transition(BookingStatus::Confirmed, now).unwrap();
        assert!(booking.expires_at.is_none());
        booking.transition(BookingStatus::CheckedIn, now).unwrap();
        booking.transition(BookingStatus::Completed, now).unwrap();

        assert_eq!(booking.status, BookingStatus::Completed);
        assert!(booking.held_at.is_some());
        assert!(booking.completed_at.is_some());
    }

    #[test]
    fn test_invalid_transition_leaves_booking_untouched() {
        let now = Utc::now();
        let mut booking = Booking::new_pending(&request(), now, now + Duration::minutes(10));

        let result = booking.transition(BookingStatus::Paid, now);
        assert!(matches!(result, Err(CoreError::InvalidTransition { .. })));
        assert_eq!(booking.status, BookingStatus::Pending);
        assert!(booking.paid_at.is_none());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            BookingStatus::Cancelled,
            BookingStatus::Expired,
            BookingStatus::Completed,
            BookingStatus::Failed,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(BookingStatus::Cancelled));
            assert!(!terminal.can_transition_to(BookingStatus::Held));
        }
    }

    #[test]
    fn test_cancel_and_expire_reachable_from_live_states() {
        for live in [
            BookingStatus::Pending,
            BookingStatus::Held,
            BookingStatus::Paid,
            BookingStatus::Confirmed,
            BookingStatus::CheckedIn,
        ] {
            assert!(live.can_transition_to(BookingStatus::Cancelled));
            assert!(live.can_transition_to(BookingStatus::Expired));
        }
        assert!(BookingStatus::Held.can_transition_to(BookingStatus::Failed));
        assert!(!BookingStatus::Paid.can_transition_to(BookingStatus::Failed));
    }

    #[test]
    fn test_status_string_round_trip() {
        assert_eq!("CHECKED_IN".parse::<BookingStatus>().unwrap(), BookingStatus::CheckedIn);
        assert_eq!(BookingStatus::CheckedIn.to_string(), "CHECKED_IN");
        assert!("BOGUS".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn test_request_validation() {
        let mut req = request();
        assert!(req.validate().is_ok());

        req.seat_numbers = Some(vec![1]);
        assert!(req.validate().is_err());

        req.seat_numbers = Some(vec![2, 2]);
        assert!(req.validate().is_err());

        req.seat_numbers = Some(vec![0, 1]);
        assert!(req.validate().is_err());

        req.seat_numbers = Some(vec![3, 1]);
        assert!(req.validate().is_ok());

        req.seat_count = 0;
        req.seat_numbers = None;
        assert!(req.validate().is_err());
    }
}
