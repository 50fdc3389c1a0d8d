use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::booking::{Booking, BookingStatus};
use crate::hold::SeatHold;
use crate::CoreResult;

/// Shared low-latency key/value store with per-key TTLs (Redis in production).
///
/// Every conditional operation is atomic on the store side.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Set `key` only if it does not exist. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool>;

    async fn get(&self, key: &str) -> CoreResult<Option<String>>;

    async fn get_many(&self, keys: &[String]) -> CoreResult<Vec<Option<String>>>;

    /// Write every entry with the same TTL, all or nothing.
    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> CoreResult<()>;

    async fn delete(&self, key: &str) -> CoreResult<()>;

    /// Delete `key` only while it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> CoreResult<bool>;

    /// Reset the TTL of `key` only while it still holds `expected`.
    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> CoreResult<bool>;

    /// All live entries whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, String)>>;

    async fn ping(&self) -> CoreResult<()>;
}

/// Durable booking table
#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Insert a new booking. When a booking with the same idempotency key
    /// already exists, nothing is written and the existing row is returned.
    async fn create(&self, booking: &Booking) -> CoreResult<Booking>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<Booking>>;

    async fn find_by_idempotency_key(&self, key: &str) -> CoreResult<Option<Booking>>;

    /// Persist `booking` only if the stored status is still `expected`.
    /// Returns false when another writer moved the booking first.
    async fn update(&self, booking: &Booking, expected: BookingStatus) -> CoreResult<bool>;

    /// Seats of CONFIRMED and CHECKED_IN bookings for one route and date.
    async fn occupied_seats(&self, route_id: Uuid, travel_date: NaiveDate) -> CoreResult<Vec<i32>>;

    /// PENDING bookings whose pre-confirmation expiry has passed.
    async fn find_stale_pending(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>>;
}

/// Durable backup of seat holds
#[async_trait]
pub trait SeatHoldRepository: Send + Sync {
    /// Insert all rows in one transaction. A row for the same
    /// (route, date, seat, booking) is reactivated with the new times.
    async fn insert_holds(&self, holds: &[SeatHold]) -> CoreResult<()>;

    /// Mark the booking's unreleased rows for `seats` released.
    async fn release(&self, booking_id: Uuid, seats: &[i32], at: DateTime<Utc>) -> CoreResult<u64>;

    /// Mark a single row released if it is unreleased and its expiry is at
    /// or before `at`. A row refreshed since it was read stays active.
    async fn release_hold(&self, hold_id: Uuid, at: DateTime<Utc>) -> CoreResult<bool>;

    /// Advance expires_at on the booking's unreleased rows; never moves it back.
    async fn extend(&self, booking_id: Uuid, expires_at: DateTime<Utc>) -> CoreResult<u64>;

    async fn active_for_pool(
        &self,
        route_id: Uuid,
        travel_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<SeatHold>>;

    async fn for_booking(&self, booking_id: Uuid) -> CoreResult<Vec<SeatHold>>;

    /// Unreleased rows whose expiry has passed, oldest first.
    async fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<SeatHold>>;
}

/// Seat capacity of a route, owned by the route/driver service
#[async_trait]
pub trait CapacityProvider: Send + Sync {
    async fn seat_capacity(&self, route_id: Uuid) -> CoreResult<Option<u32>>;
}
