//! In-memory stand-ins for the Redis, Postgres, Kafka and route-service
//! adapters.
//!
//! They honour the same contracts as the real adapters (TTL expiry,
//! compare-and-set semantics, idempotency-key uniqueness) so the booking
//! core can be exercised end to end without infrastructure. Time is taken
//! from an injected [`Clock`], which lets tests let a hold lapse by
//! advancing a [`ManualClock`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use ridepool_core::events::{BookingEvent, EventPublisher};
use ridepool_core::payment::{PaymentGateway, RefundRequest};
use ridepool_core::repository::{BookingRepository, CapacityProvider, FastStore, SeatHoldRepository};
use ridepool_core::{Booking, BookingStatus, Clock, CoreError, CoreResult, SeatHold};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = guard(&self.now);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *guard(&self.now)
    }
}

#[derive(Debug, Clone)]
struct FastEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Fast store with Redis-like TTL semantics.
pub struct InMemoryFastStore {
    entries: Mutex<HashMap<String, FastEntry>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl InMemoryFastStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails until switched back on.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop a key as if the store had evicted it under memory pressure.
    pub fn evict(&self, key: &str) {
        guard(&self.entries).remove(key);
    }

    /// Remaining TTL of a live key.
    pub fn ttl(&self, key: &str) -> Option<chrono::Duration> {
        let now = self.clock.now();
        guard(&self.entries)
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.expires_at - now)
    }

    fn check_available(&self) -> CoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::FastStore("connection refused".to_string()))
        }
    }

    fn expiry(&self, ttl: Duration) -> CoreResult<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CoreError::InternalError(format!("TTL out of range: {}", e)))?;
        Ok(self.clock.now() + ttl)
    }

    fn live_entries(&self) -> MutexGuard<'_, HashMap<String, FastEntry>> {
        let now = self.clock.now();
        let mut entries = guard(&self.entries);
        entries.retain(|_, e| e.expires_at > now);
        entries
    }
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool> {
        self.check_available()?;
        let expires_at = self.expiry(ttl)?;
        let mut entries = self.live_entries();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), FastEntry { value: value.to_string(), expires_at });
        Ok(true)
    }

    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        self.check_available()?;
        Ok(self.live_entries().get(key).map(|e| e.value.clone()))
    }

    async fn get_many(&self, keys: &[String]) -> CoreResult<Vec<Option<String>>> {
        self.check_available()?;
        let entries = self.live_entries();
        Ok(keys.iter().map(|k| entries.get(k).map(|e| e.value.clone())).collect())
    }

    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> CoreResult<()> {
        self.check_available()?;
        let expires_at = self.expiry(ttl)?;
        let mut live = self.live_entries();
        for (key, value) in entries {
            live.insert(key.clone(), FastEntry { value: value.clone(), expires_at });
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        self.check_available()?;
        self.live_entries().remove(key);
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> CoreResult<bool> {
        self.check_available()?;
        let mut entries = self.live_entries();
        if entries.get(key).map(|e| e.value == expected).unwrap_or(false) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> CoreResult<bool> {
        self.check_available()?;
        let expires_at = self.expiry(ttl)?;
        let mut entries = self.live_entries();
        match entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, String)>> {
        self.check_available()?;
        Ok(self
            .live_entries()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn ping(&self) -> CoreResult<()> {
        self.check_available()
    }
}

#[derive(Default)]
pub struct InMemoryBookingRepository {
    bookings: Mutex<HashMap<Uuid, Booking>>,
}

impl InMemoryBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Booking> {
        guard(&self.bookings).values().cloned().collect()
    }
}

#[async_trait]
impl BookingRepository for InMemoryBookingRepository {
    async fn create(&self, booking: &Booking) -> CoreResult<Booking> {
        let mut bookings = guard(&self.bookings);
        if let Some(existing) = bookings
            .values()
            .find(|b| b.idempotency_key == booking.idempotency_key)
        {
            return Ok(existing.clone());
        }
        bookings.insert(booking.id, booking.clone());
        Ok(booking.clone())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Booking>> {
        Ok(guard(&self.bookings).get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> CoreResult<Option<Booking>> {
        Ok(guard(&self.bookings)
            .values()
            .find(|b| b.idempotency_key == key)
            .cloned())
    }

    async fn update(&self, booking: &Booking, expected: BookingStatus) -> CoreResult<bool> {
        let mut bookings = guard(&self.bookings);
        match bookings.get_mut(&booking.id) {
            Some(stored) if stored.status == expected => {
                *stored = booking.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn occupied_seats(&self, route_id: Uuid, travel_date: NaiveDate) -> CoreResult<Vec<i32>> {
        Ok(guard(&self.bookings)
            .values()
            .filter(|b| b.route_id == route_id && b.travel_date == travel_date && b.status.occupies_seats())
            .flat_map(|b| b.seat_numbers.iter().copied())
            .collect())
    }

    async fn find_stale_pending(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let mut stale: Vec<Booking> = guard(&self.bookings)
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.is_hold_expired(now))
            .cloned()
            .collect();
        stale.sort_by_key(|b| b.expires_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[derive(Default)]
pub struct InMemorySeatHoldRepository {
    rows: Mutex<Vec<SeatHold>>,
    fail_writes: AtomicBool,
}

impl InMemorySeatHoldRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail, as if the database were down.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<SeatHold> {
        guard(&self.rows).clone()
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(CoreError::Durable("database unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SeatHoldRepository for InMemorySeatHoldRepository {
    async fn insert_holds(&self, holds: &[SeatHold]) -> CoreResult<()> {
        self.check_writable()?;
        let mut rows = guard(&self.rows);
        for hold in holds {
            let existing = rows.iter_mut().find(|r| {
                r.route_id == hold.route_id
                    && r.travel_date == hold.travel_date
                    && r.seat_number == hold.seat_number
                    && r.booking_id == hold.booking_id
            });
            match existing {
                Some(row) => {
                    row.held_at = hold.held_at;
                    row.expires_at = hold.expires_at;
                    row.released_at = None;
                }
                None => rows.push(hold.clone()),
            }
        }
        Ok(())
    }

    async fn release(&self, booking_id: Uuid, seats: &[i32], at: DateTime<Utc>) -> CoreResult<u64> {
        self.check_writable()?;
        let mut released = 0;
        for row in guard(&self.rows).iter_mut() {
            if row.booking_id == booking_id && seats.contains(&row.seat_number) && row.released_at.is_none() {
                row.released_at = Some(at);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_hold(&self, hold_id: Uuid, at: DateTime<Utc>) -> CoreResult<bool> {
        self.check_writable()?;
        let mut rows = guard(&self.rows);
        match rows
            .iter_mut()
            .find(|r| r.id == hold_id && r.released_at.is_none() && r.expires_at <= at)
        {
            Some(row) => {
                row.released_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn extend(&self, booking_id: Uuid, expires_at: DateTime<Utc>) -> CoreResult<u64> {
        self.check_writable()?;
        let mut extended = 0;
        for row in guard(&self.rows).iter_mut() {
            if row.booking_id == booking_id && row.released_at.is_none() {
                row.expires_at = row.expires_at.max(expires_at);
                extended += 1;
            }
        }
        Ok(extended)
    }

    async fn active_for_pool(
        &self,
        route_id: Uuid,
        travel_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<SeatHold>> {
        Ok(guard(&self.rows)
            .iter()
            .filter(|r| r.route_id == route_id && r.travel_date == travel_date && r.is_active(now))
            .cloned()
            .collect())
    }

    async fn for_booking(&self, booking_id: Uuid) -> CoreResult<Vec<SeatHold>> {
        let mut rows: Vec<SeatHold> = guard(&self.rows)
            .iter()
            .filter(|r| r.booking_id == booking_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.seat_number);
        Ok(rows)
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<SeatHold>> {
        let mut expired: Vec<SeatHold> = guard(&self.rows)
            .iter()
            .filter(|r| r.released_at.is_none() && r.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }
}

/// Fixed route capacities, counting lookups.
#[derive(Default)]
pub struct StaticCapacity {
    routes: Mutex<HashMap<Uuid, u32>>,
    lookups: AtomicUsize,
}

impl StaticCapacity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(route_id: Uuid, capacity: u32) -> Self {
        let provider = Self::new();
        provider.set(route_id, capacity);
        provider
    }

    pub fn set(&self, route_id: Uuid, capacity: u32) {
        guard(&self.routes).insert(route_id, capacity);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapacityProvider for StaticCapacity {
    async fn seat_capacity(&self, route_id: Uuid) -> CoreResult<Option<u32>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(guard(&self.routes).get(&route_id).copied())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<BookingEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BookingEvent> {
        guard(&self.events).clone()
    }

    pub fn statuses_for(&self, booking_id: Uuid) -> Vec<BookingStatus> {
        guard(&self.events)
            .iter()
            .filter(|e| e.booking_id == booking_id)
            .map(|e| e.status)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &BookingEvent) -> CoreResult<()> {
        guard(&self.events).push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPaymentGateway {
    refunds: Mutex<Vec<RefundRequest>>,
}

impl RecordingPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refunds(&self) -> Vec<RefundRequest> {
        guard(&self.refunds).clone()
    }
}

#[async_trait]
impl PaymentGateway for RecordingPaymentGateway {
    async fn request_refund(&self, refund: &RefundRequest) -> CoreResult<()> {
        guard(&self.refunds).push(refund.clone());
        Ok(())
    }
}
