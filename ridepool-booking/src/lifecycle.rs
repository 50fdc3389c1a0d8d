use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ridepool_core::events::{BookingEvent, EventPublisher};
use ridepool_core::payment::{PaymentGateway, RefundRequest};
use ridepool_core::repository::BookingRepository;
use ridepool_core::{Booking, BookingStatus, Clock, CoreError, CoreResult, ResourceKey, ReserveSeats};

use crate::availability::{Availability, AvailabilityCalculator};
use crate::hold_store::{to_chrono, HoldStore};
use crate::lock::LockCoordinator;
use crate::Ports;

/// Timing knobs for holds and pool locks
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Lifetime of a fresh hold.
    pub hold_ttl: Duration,
    /// Ceiling for an extended hold, counted from when the seats were held.
    pub extended_hold_ttl: Duration,
    pub lock_max_wait: Duration,
    pub lock_lease: Duration,
    pub lock_retry_interval: Duration,
    pub reconcile_batch_size: i64,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            hold_ttl: Duration::from_secs(600),
            extended_hold_ttl: Duration::from_secs(900),
            lock_max_wait: Duration::from_millis(2000),
            lock_lease: Duration::from_millis(5000),
            lock_retry_interval: Duration::from_millis(25),
            reconcile_batch_size: 500,
        }
    }
}

/// Drives bookings through their lifecycle.
///
/// ```text
/// PENDING -> HELD -> PAID -> CONFIRMED -> CHECKED_IN -> COMPLETED
///    |         |       |         |            |
///    +---------+-------+---------+------------+--> CANCELLED / EXPIRED
/// PENDING, HELD -> FAILED
/// ```
///
/// Every status write is a compare-and-set against the status the decision
/// was made on, so concurrent callers (webhook retries, the reconciler, a
/// rider cancelling) cannot overwrite each other.
pub struct BookingController {
    bookings: Arc<dyn BookingRepository>,
    holds: Arc<HoldStore>,
    availability: Arc<AvailabilityCalculator>,
    lock: LockCoordinator,
    payments: Arc<dyn PaymentGateway>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
}

impl BookingController {
    pub fn new(
        ports: &Ports,
        holds: Arc<HoldStore>,
        availability: Arc<AvailabilityCalculator>,
        lock: LockCoordinator,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            bookings: ports.bookings.clone(),
            holds,
            availability,
            lock,
            payments: ports.payments.clone(),
            events: ports.events.clone(),
            clock: ports.clock.clone(),
            policy,
        }
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    /// Create a booking and hold seats for it.
    ///
    /// Replaying an idempotency key returns the booking it created. A replay
    /// of a booking still PENDING (its first attempt timed out on the lock)
    /// resumes the attempt.
    pub async fn reserve_seats(&self, request: ReserveSeats) -> CoreResult<Booking> {
        request.validate()?;

        if let Some(existing) = self.bookings.find_by_idempotency_key(&request.idempotency_key).await? {
            return self.replay(existing, &request).await;
        }

        let now = self.clock.now();
        let draft = Booking::new_pending(&request, now, now + to_chrono(self.policy.hold_ttl)?);
        let booking = self.bookings.create(&draft).await?;
        if booking.id != draft.id {
            return self.replay(booking, &request).await;
        }

        info!(
            "Booking {} created for rider {}: {} seat(s) on route {} for {}",
            booking.id, booking.rider_id, booking.seat_count, booking.route_id, booking.travel_date
        );
        self.publish(&booking).await;
        self.acquire_hold(booking, request.seat_numbers.as_deref()).await
    }

    async fn replay(&self, existing: Booking, request: &ReserveSeats) -> CoreResult<Booking> {
        if existing.route_id != request.route_id
            || existing.travel_date != request.travel_date
            || existing.seat_count != request.seat_count
        {
            return Err(CoreError::ValidationError(format!(
                "idempotency key {} was already used for a different request",
                request.idempotency_key
            )));
        }

        debug!("Replayed reservation {} for booking {}", request.idempotency_key, existing.id);
        if existing.status == BookingStatus::Pending {
            return self.acquire_hold(existing, request.seat_numbers.as_deref()).await;
        }
        Ok(existing)
    }

    async fn acquire_hold(&self, booking: Booking, requested: Option<&[i32]>) -> CoreResult<Booking> {
        let pool = ResourceKey::new(booking.route_id, booking.travel_date);
        let seat_count = usize::try_from(booking.seat_count).unwrap_or_default();
        let booking_id = booking.id;

        let outcome = self
            .lock
            .with_lock(
                &pool.to_string(),
                self.policy.lock_max_wait,
                self.policy.lock_lease,
                |lease| async move {
                    let free = self.availability.allocatable_seats(pool, booking_id).await?;
                    let seats = pick_seats(&free, seat_count, requested)?;
                    self.holds.hold(&lease, pool, &seats, booking_id, self.policy.hold_ttl).await
                },
            )
            .await;

        let now = self.clock.now();
        match outcome {
            Ok(receipt) => {
                let mut held = booking;
                held.seat_numbers = receipt.seat_numbers.clone();
                held.transition(BookingStatus::Held, now)?;
                held.expires_at = Some(receipt.expires_at);

                if self.bookings.update(&held, BookingStatus::Pending).await? {
                    info!("Booking {} holds seats {:?} until {}", held.id, held.seat_numbers, receipt.expires_at);
                    self.publish(&held).await;
                    return Ok(held);
                }

                // Someone else moved the booking while we were holding.
                let current = self.load(booking_id).await?;
                let keep: BTreeSet<i32> = if current.status.has_live_hold() {
                    current.seat_numbers.iter().copied().collect()
                } else {
                    BTreeSet::new()
                };
                let surplus: Vec<i32> = receipt.seat_numbers.iter().copied().filter(|s| !keep.contains(s)).collect();
                if !surplus.is_empty() {
                    warn!("Booking {} moved to {} mid-hold, releasing seats {:?}", booking_id, current.status, surplus);
                    self.holds.release(pool, &surplus, booking_id).await?;
                }
                Ok(current)
            }
            Err(CoreError::Conflict(reason)) => {
                let mut failed = booking;
                failed.failure_reason = Some("seats unavailable".to_string());
                failed.transition(BookingStatus::Failed, now)?;

                if self.bookings.update(&failed, BookingStatus::Pending).await? {
                    info!("Booking {} failed: {}", booking_id, reason);
                    self.publish(&failed).await;
                    return Err(CoreError::Conflict(reason));
                }

                let current = self.load(booking_id).await?;
                if current.status == BookingStatus::Held {
                    return Ok(current);
                }
                Err(CoreError::Conflict(reason))
            }
            Err(e) => {
                warn!("Booking {} left pending, hold attempt failed: {}", booking_id, e);
                Err(e)
            }
        }
    }

    /// Payment webhook entry point: HELD -> PAID -> CONFIRMED.
    pub async fn handle_payment_confirmed(&self, booking_id: Uuid, payment_id: &str) -> CoreResult<Booking> {
        let paid = self.mark_paid(booking_id, payment_id).await?;
        if paid.status == BookingStatus::Paid {
            return self.confirm(booking_id).await;
        }
        Ok(paid)
    }

    /// HELD -> PAID, only while the hold is still live.
    ///
    /// A payment that arrives for a booking that can no longer take it is
    /// refunded.
    pub async fn mark_paid(&self, booking_id: Uuid, payment_id: &str) -> CoreResult<Booking> {
        let mut booking = self.load(booking_id).await?;

        match booking.status {
            BookingStatus::Held => {}
            status if status.is_paid() || status == BookingStatus::Completed => {
                if booking.payment_id.as_deref() == Some(payment_id) {
                    debug!("Payment {} for booking {} already recorded", payment_id, booking_id);
                    return Ok(booking);
                }
                self.request_refund(&booking, Some(payment_id), "duplicate payment").await;
                return Err(CoreError::InvalidTransition {
                    from: status,
                    to: BookingStatus::Paid,
                });
            }
            BookingStatus::Expired => {
                self.request_refund(&booking, Some(payment_id), "payment arrived after hold expired")
                    .await;
                return Err(CoreError::HoldExpired(booking_id));
            }
            status @ (BookingStatus::Cancelled | BookingStatus::Failed) => {
                let reason = format!("payment arrived for {} booking", status);
                self.request_refund(&booking, Some(payment_id), &reason).await;
                return Err(CoreError::InvalidTransition {
                    from: status,
                    to: BookingStatus::Paid,
                });
            }
            status => {
                return Err(CoreError::InvalidTransition {
                    from: status,
                    to: BookingStatus::Paid,
                })
            }
        }

        let now = self.clock.now();
        if !self.hold_is_live(&booking, now).await? {
            warn!("Payment {} arrived after the hold of booking {} lapsed", payment_id, booking_id);
            self.expire_booking(booking.clone(), "hold expired before payment").await?;
            self.request_refund(&booking, Some(payment_id), "payment arrived after hold expired")
                .await;
            return Err(CoreError::HoldExpired(booking_id));
        }

        booking.payment_id = Some(payment_id.to_string());
        booking.transition(BookingStatus::Paid, now)?;
        self.commit(&booking, BookingStatus::Held).await?;

        info!("Booking {} paid with {}", booking_id, payment_id);
        Ok(booking)
    }

    /// PAID -> CONFIRMED under the pool lease, after checking the seats are
    /// still this booking's. If they were lost the booking is cancelled and
    /// refunded.
    pub async fn confirm(&self, booking_id: Uuid) -> CoreResult<Booking> {
        let booking = self.load(booking_id).await?;
        match booking.status {
            BookingStatus::Paid => {}
            BookingStatus::Confirmed | BookingStatus::CheckedIn | BookingStatus::Completed => return Ok(booking),
            status => {
                return Err(CoreError::InvalidTransition {
                    from: status,
                    to: BookingStatus::Confirmed,
                })
            }
        }

        let pool = ResourceKey::new(booking.route_id, booking.travel_date);
        let paid = &booking;
        let outcome = self
            .lock
            .with_lock(
                &pool.to_string(),
                self.policy.lock_max_wait,
                self.policy.lock_lease,
                |lease| async move {
                    let now = self.clock.now();
                    let mut lost = self.holds.find_conflicts(pool, &paid.seat_numbers, booking_id, now).await?;
                    let occupied = self.bookings.occupied_seats(pool.route_id, pool.travel_date).await?;
                    lost.extend(paid.seat_numbers.iter().filter(|s| occupied.contains(*s)));
                    if !lost.is_empty() {
                        lost.sort_unstable();
                        lost.dedup();
                        return Err(CoreError::Conflict(format!("seats {:?} were lost before confirmation", lost)));
                    }

                    if !self.lock.is_held(&lease).await? {
                        return Err(CoreError::LeaseLost(pool.to_string()));
                    }

                    let mut confirmed = paid.clone();
                    confirmed.transition(BookingStatus::Confirmed, now)?;
                    if !self.bookings.update(&confirmed, BookingStatus::Paid).await? {
                        return Err(self.lost_race(booking_id, BookingStatus::Confirmed).await);
                    }
                    Ok(confirmed)
                },
            )
            .await;

        match outcome {
            Ok(confirmed) => {
                if let Err(e) = self.release_booking_holds(&confirmed).await {
                    warn!("Confirmed booking {} kept its hold entries, they lapse on their own: {}", booking_id, e);
                }
                self.publish(&confirmed).await;
                info!("Booking {} confirmed for seats {:?}", booking_id, confirmed.seat_numbers);
                Ok(confirmed)
            }
            Err(CoreError::Conflict(reason)) => {
                warn!("Cancelling paid booking {}: {}", booking_id, reason);
                let mut cancelled = booking;
                cancelled.cancellation_reason = Some(reason.clone());
                cancelled.transition(BookingStatus::Cancelled, self.clock.now())?;
                if self.bookings.update(&cancelled, BookingStatus::Paid).await? {
                    self.request_refund(&cancelled, None, &reason).await;
                    if let Err(e) = self.release_booking_holds(&cancelled).await {
                        error!("Failed to release holds of cancelled booking {}: {}", booking_id, e);
                    }
                    self.publish(&cancelled).await;
                }
                Err(CoreError::Conflict(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Push a HELD booking's hold out to the extension ceiling.
    ///
    /// Calling it again once extended changes nothing; it never shortens
    /// the hold.
    pub async fn extend_hold(&self, booking_id: Uuid) -> CoreResult<Booking> {
        let mut booking = self.load(booking_id).await?;
        if booking.status != BookingStatus::Held {
            return Err(CoreError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::Held,
            });
        }

        let now = self.clock.now();
        if booking.is_hold_expired(now) {
            return Err(CoreError::HoldExpired(booking_id));
        }

        let held_at = booking.held_at.unwrap_or(booking.created_at);
        let target = held_at + to_chrono(self.policy.extended_hold_ttl)?;
        let current = booking.expires_at.unwrap_or(now);
        if target <= current {
            debug!("Hold of booking {} already extended to {}", booking_id, current);
            return Ok(booking);
        }

        let ttl = (target - now)
            .to_std()
            .map_err(|e| CoreError::InternalError(format!("Extension target in the past: {}", e)))?;
        let expires_at = match self.holds.extend(booking_id, ttl).await {
            Ok(expires_at) => expires_at,
            Err(CoreError::HoldNotFound(_)) => {
                warn!("Hold metadata for booking {} missing, re-holding its seats", booking_id);
                self.rehold(&booking, ttl).await?
            }
            Err(e) => return Err(e),
        };

        booking.expires_at = Some(expires_at);
        booking.updated_at = now;
        if !self.bookings.update(&booking, BookingStatus::Held).await? {
            return Err(self.lost_race(booking_id, BookingStatus::Held).await);
        }

        info!("Hold of booking {} extended until {}", booking_id, expires_at);
        Ok(booking)
    }

    async fn rehold(&self, booking: &Booking, ttl: Duration) -> CoreResult<DateTime<Utc>> {
        let pool = ResourceKey::new(booking.route_id, booking.travel_date);
        let receipt = self
            .lock
            .with_lock(
                &pool.to_string(),
                self.policy.lock_max_wait,
                self.policy.lock_lease,
                |lease| async move { self.holds.hold(&lease, pool, &booking.seat_numbers, booking.id, ttl).await },
            )
            .await?;
        Ok(receipt.expires_at)
    }

    /// Cancel a booking in any non-terminal state, releasing its seats and
    /// refunding it if it was paid.
    ///
    /// If the seats cannot be released the booking stays CANCELLED and the
    /// store error is returned. Cancelling again retries the release;
    /// otherwise it is a no-op.
    pub async fn cancel_booking(&self, booking_id: Uuid, reason: &str) -> CoreResult<Booking> {
        let booking = self.load(booking_id).await?;
        if booking.status == BookingStatus::Cancelled {
            if self.has_unreleased_holds(&booking).await? {
                info!("Retrying seat release for cancelled booking {}", booking_id);
                self.release_booking_holds(&booking).await?;
            }
            return Ok(booking);
        }

        let expected = booking.status;
        let mut cancelled = booking;
        cancelled.cancellation_reason = Some(reason.to_string());
        cancelled.transition(BookingStatus::Cancelled, self.clock.now())?;
        self.commit(&cancelled, expected).await?;

        if expected.is_paid() {
            self.request_refund(&cancelled, cancelled.payment_id.as_deref(), reason).await;
        }
        if let Err(e) = self.release_booking_holds(&cancelled).await {
            error!("Booking {} cancelled but its seats are still held: {}", booking_id, e);
            return Err(e);
        }

        info!("Booking {} cancelled from {}: {}", booking_id, expected, reason);
        Ok(cancelled)
    }

    pub async fn check_in(&self, booking_id: Uuid) -> CoreResult<Booking> {
        self.advance(booking_id, BookingStatus::CheckedIn).await
    }

    pub async fn complete(&self, booking_id: Uuid) -> CoreResult<Booking> {
        self.advance(booking_id, BookingStatus::Completed).await
    }

    async fn advance(&self, booking_id: Uuid, next: BookingStatus) -> CoreResult<Booking> {
        let mut booking = self.load(booking_id).await?;
        if booking.status == next {
            return Ok(booking);
        }

        let expected = booking.status;
        booking.transition(next, self.clock.now())?;
        self.commit(&booking, expected).await?;
        info!("Booking {} moved {} -> {}", booking_id, expected, next);
        Ok(booking)
    }

    /// PENDING or HELD -> EXPIRED, releasing whatever the booking still
    /// holds. Returns None when the booking is in another state or another
    /// writer got there first.
    pub async fn expire_booking(&self, booking: Booking, reason: &str) -> CoreResult<Option<Booking>> {
        if !matches!(booking.status, BookingStatus::Pending | BookingStatus::Held) {
            return Ok(None);
        }

        let expected = booking.status;
        let mut expired = booking;
        expired.failure_reason = Some(reason.to_string());
        expired.transition(BookingStatus::Expired, self.clock.now())?;
        if !self.bookings.update(&expired, expected).await? {
            debug!("Booking {} changed before it could expire", expired.id);
            return Ok(None);
        }

        if let Err(e) = self.release_booking_holds(&expired).await {
            error!("Failed to release holds of expired booking {}: {}", expired.id, e);
        }
        self.publish(&expired).await;
        info!("Booking {} expired from {}: {}", expired.id, expected, reason);
        Ok(Some(expired))
    }

    pub async fn get_booking(&self, booking_id: Uuid) -> CoreResult<Booking> {
        self.load(booking_id).await
    }

    pub async fn get_availability(&self, route_id: Uuid, travel_date: NaiveDate) -> CoreResult<Availability> {
        self.availability.snapshot(route_id, travel_date).await
    }

    async fn load(&self, booking_id: Uuid) -> CoreResult<Booking> {
        self.bookings
            .get(booking_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", booking_id)))
    }

    /// Compare-and-set write followed by the status event.
    async fn commit(&self, booking: &Booking, expected: BookingStatus) -> CoreResult<()> {
        if !self.bookings.update(booking, expected).await? {
            return Err(self.lost_race(booking.id, booking.status).await);
        }
        self.publish(booking).await;
        Ok(())
    }

    async fn lost_race(&self, booking_id: Uuid, target: BookingStatus) -> CoreError {
        match self.load(booking_id).await {
            Ok(current) => CoreError::InvalidTransition {
                from: current.status,
                to: target,
            },
            Err(e) => e,
        }
    }

    async fn hold_is_live(&self, booking: &Booking, now: DateTime<Utc>) -> CoreResult<bool> {
        if booking.is_hold_expired(now) {
            return Ok(false);
        }
        let active: BTreeSet<i32> = self
            .holds
            .durable_holds_for(booking.id)
            .await?
            .into_iter()
            .filter(|row| row.is_active(now))
            .map(|row| row.seat_number)
            .collect();
        Ok(booking.seat_numbers.iter().all(|seat| active.contains(seat)))
    }

    /// Release every seat the booking holds in either store.
    ///
    /// When this fails the durable rows stay active, so the seats remain
    /// blocked until a retry succeeds or the reconciler sweeps them at expiry.
    async fn release_booking_holds(&self, booking: &Booking) -> CoreResult<()> {
        let pool = ResourceKey::new(booking.route_id, booking.travel_date);
        let mut seats: BTreeSet<i32> = booking.seat_numbers.iter().copied().collect();
        seats.extend(
            self.holds
                .durable_holds_for(booking.id)
                .await?
                .into_iter()
                .filter(|row| row.released_at.is_none())
                .map(|row| row.seat_number),
        );

        let seats: Vec<i32> = seats.into_iter().collect();
        self.holds.release(pool, &seats, booking.id).await?;
        Ok(())
    }

    async fn has_unreleased_holds(&self, booking: &Booking) -> CoreResult<bool> {
        Ok(self
            .holds
            .durable_holds_for(booking.id)
            .await?
            .iter()
            .any(|row| row.released_at.is_none()))
    }

    async fn request_refund(&self, booking: &Booking, payment_id: Option<&str>, reason: &str) {
        let refund = RefundRequest {
            booking_id: booking.id,
            payment_id: payment_id.map(str::to_string).or_else(|| booking.payment_id.clone()),
            reason: reason.to_string(),
            requested_at: self.clock.now(),
        };
        match self.payments.request_refund(&refund).await {
            Ok(()) => info!("Refund requested for booking {}: {}", booking.id, reason),
            Err(e) => error!("Refund request for booking {} failed: {}", booking.id, e),
        }
    }

    async fn publish(&self, booking: &Booking) {
        if let Err(e) = self.events.publish(&BookingEvent::from_booking(booking)).await {
            warn!("Failed to publish {} event for booking {}: {}", booking.status, booking.id, e);
        }
    }
}

/// Requested seats must all be free; otherwise take the lowest free seats.
fn pick_seats(free: &BTreeSet<i32>, count: usize, requested: Option<&[i32]>) -> CoreResult<Vec<i32>> {
    match requested {
        Some(seats) => {
            let missing: Vec<i32> = seats.iter().copied().filter(|s| !free.contains(s)).collect();
            if !missing.is_empty() {
                return Err(CoreError::Conflict(format!("seats {:?} are not available", missing)));
            }
            Ok(seats.to_vec())
        }
        None => {
            if free.len() < count {
                return Err(CoreError::Conflict(format!(
                    "{} seat(s) requested but only {} available",
                    count,
                    free.len()
                )));
            }
            Ok(free.iter().copied().take(count).collect())
        }
    }
}
