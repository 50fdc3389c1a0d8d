use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One held seat, as mirrored into the durable `seat_holds` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeatHold {
    pub id: Uuid,
    pub route_id: Uuid,
    pub travel_date: NaiveDate,
    pub seat_number: i32,
    pub booking_id: Uuid,
    pub held_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl SeatHold {
    pub fn new(
        route_id: Uuid,
        travel_date: NaiveDate,
        seat_number: i32,
        booking_id: Uuid,
        held_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            route_id,
            travel_date,
            seat_number,
            booking_id,
            held_at,
            expires_at,
            released_at: None,
        }
    }

    /// Not released and not past its expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && self.expires_at > now
    }
}

/// Per-booking entry in the fast store, used for bulk extension and release
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HoldMetadata {
    pub booking_id: Uuid,
    pub route_id: Uuid,
    pub travel_date: NaiveDate,
    pub seat_numbers: Vec<i32>,
    pub held_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Key of the seat pool for one route on one travel date.
///
/// Formats as `route:{routeId}:{date}`, which is also the lock name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub route_id: Uuid,
    pub travel_date: NaiveDate,
}

impl ResourceKey {
    pub fn new(route_id: Uuid, travel_date: NaiveDate) -> Self {
        Self { route_id, travel_date }
    }

    fn date(&self) -> String {
        self.travel_date.format("%Y-%m-%d").to_string()
    }

    /// Prefix shared by every seat entry of this pool.
    pub fn seat_prefix(&self) -> String {
        format!("hold:{}:{}:", self.route_id, self.date())
    }

    pub fn seat_key(&self, seat_number: i32) -> String {
        format!("{}{}", self.seat_prefix(), seat_number)
    }

    /// Seat number encoded in a seat entry key of this pool.
    pub fn parse_seat_key(&self, key: &str) -> Option<i32> {
        key.strip_prefix(&self.seat_prefix())?.parse().ok()
    }

    pub fn metadata_key(booking_id: Uuid) -> String {
        format!("hold:booking:{}", booking_id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route:{}:{}", self.route_id, self.date())
    }
}
