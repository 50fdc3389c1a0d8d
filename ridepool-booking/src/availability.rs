use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use ridepool_core::repository::BookingRepository;
use ridepool_core::{CoreError, CoreResult, ResourceKey};

use crate::capacity::CapacityCache;
use crate::hold_store::HoldStore;

/// Seat picture for one route on one date
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Availability {
    pub route_id: Uuid,
    pub travel_date: NaiveDate,
    pub total: u32,
    pub available: usize,
    pub booked: usize,
    pub held: usize,
    /// Free seat numbers, ascending.
    pub seats: Vec<i32>,
    /// Holds came from the durable backup because the fast store was down.
    pub degraded: bool,
}

/// Free seats = capacity minus confirmed bookings minus live holds, where a
/// hold counts if either the fast store or the durable backup has it.
///
/// Reads take no lock. Callers that act on the answer (the reserve path)
/// must recompute it under the pool lease.
pub struct AvailabilityCalculator {
    bookings: Arc<dyn BookingRepository>,
    holds: Arc<HoldStore>,
    capacity: Arc<CapacityCache>,
}

impl AvailabilityCalculator {
    pub fn new(bookings: Arc<dyn BookingRepository>, holds: Arc<HoldStore>, capacity: Arc<CapacityCache>) -> Self {
        Self {
            bookings,
            holds,
            capacity,
        }
    }

    pub async fn snapshot(&self, route_id: Uuid, travel_date: NaiveDate) -> CoreResult<Availability> {
        let pool = ResourceKey::new(route_id, travel_date);
        let total = self.capacity.capacity(route_id).await?;
        let booked = self.booked_seats(pool).await?;

        let (held, degraded) = match self.holds.list_held_seats(pool).await {
            Ok(mut held) => {
                held.extend(self.holds.durable_active_seats(pool).await?);
                (held, false)
            }
            Err(CoreError::FastStore(reason)) => {
                warn!("Fast store unavailable for {}, reading holds from durable backup: {}", pool, reason);
                (self.holds.durable_active_seats(pool).await?, true)
            }
            Err(e) => return Err(e),
        };

        let seats: Vec<i32> = seat_range(total)
            .filter(|seat| !booked.contains(seat) && !held.contains(seat))
            .collect();

        Ok(Availability {
            route_id,
            travel_date,
            total,
            available: seats.len(),
            booked: booked.len(),
            held: held.difference(&booked).count(),
            seats,
            degraded,
        })
    }

    pub async fn available_seats(&self, route_id: Uuid, travel_date: NaiveDate) -> CoreResult<BTreeSet<i32>> {
        Ok(self.snapshot(route_id, travel_date).await?.seats.into_iter().collect())
    }

    pub async fn available_count(&self, route_id: Uuid, travel_date: NaiveDate) -> CoreResult<usize> {
        Ok(self.snapshot(route_id, travel_date).await?.available)
    }

    /// Seats `booking_id` may take: free seats plus those it already holds.
    ///
    /// A seat held by another booking in either store is excluded, so an
    /// entry the fast store dropped early still blocks its seat while the
    /// durable row is active. Used under the pool lease, so a fast store
    /// outage is an error here rather than a fallback.
    pub async fn allocatable_seats(&self, pool: ResourceKey, booking_id: Uuid) -> CoreResult<BTreeSet<i32>> {
        let total = self.capacity.capacity(pool.route_id).await?;
        let booked = self.booked_seats(pool).await?;
        let owner = booking_id.to_string();
        let mut held_by_others: BTreeSet<i32> = self
            .holds
            .holders(pool)
            .await?
            .into_iter()
            .filter(|(_, holder)| *holder != owner)
            .map(|(seat, _)| seat)
            .collect();
        held_by_others.extend(
            self.holds
                .durable_holders(pool)
                .await?
                .into_iter()
                .filter(|(_, holder)| *holder != booking_id)
                .map(|(seat, _)| seat),
        );

        Ok(seat_range(total)
            .filter(|seat| !booked.contains(seat) && !held_by_others.contains(seat))
            .collect())
    }

    async fn booked_seats(&self, pool: ResourceKey) -> CoreResult<BTreeSet<i32>> {
        Ok(self
            .bookings
            .occupied_seats(pool.route_id, pool.travel_date)
            .await?
            .into_iter()
            .collect())
    }
}

fn seat_range(total: u32) -> impl Iterator<Item = i32> {
    1..=i32::try_from(total).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockCoordinator;
    use chrono::Utc;
    use ridepool_core::repository::SeatHoldRepository;
    use ridepool_core::{Booking, BookingStatus, ReserveSeats};
    use ridepool_store::memory::{
        InMemoryBookingRepository, InMemoryFastStore, InMemorySeatHoldRepository, ManualClock, StaticCapacity,
    };
    use std::time::Duration;

    struct Fixture {
        fast: Arc<InMemoryFastStore>,
        bookings: Arc<InMemoryBookingRepository>,
        lock: LockCoordinator,
        holds: Arc<HoldStore>,
        calculator: AvailabilityCalculator,
        pool: ResourceKey,
    }

    fn fixture(capacity: u32) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let fast = Arc::new(InMemoryFastStore::new(clock.clone()));
        let durable: Arc<dyn SeatHoldRepository> = Arc::new(InMemorySeatHoldRepository::new());
        let bookings = Arc::new(InMemoryBookingRepository::new());
        let lock = LockCoordinator::new(fast.clone(), clock.clone(), Duration::from_millis(5));
        let holds = Arc::new(HoldStore::new(fast.clone(), durable, lock.clone(), clock));
        let pool = ResourceKey::new(Uuid::new_v4(), NaiveDate::from_ymd_opt(2026, 11, 3).unwrap());
        let capacity = Arc::new(CapacityCache::new(Arc::new(StaticCapacity::with_route(pool.route_id, capacity))));
        let calculator = AvailabilityCalculator::new(bookings.clone(), holds.clone(), capacity);
        Fixture {
            fast,
            bookings,
            lock,
            holds,
            calculator,
            pool,
        }
    }

    async fn confirmed_booking(f: &Fixture, seats: Vec<i32>) {
        let request = ReserveSeats {
            rider_id: "rider-1".to_string(),
            route_id: f.pool.route_id,
            travel_date: f.pool.travel_date,
            seat_count: seats.len() as i32,
            seat_numbers: None,
            idempotency_key: Uuid::new_v4().to_string(),
        };
        let now = Utc::now();
        let mut booking = Booking::new_pending(&request, now, now);
        booking.seat_numbers = seats;
        booking.status = BookingStatus::Confirmed;
        f.bookings.create(&booking).await.unwrap();
    }

    async fn hold(f: &Fixture, seats: &[i32], booking: Uuid) {
        let lease = f
            .lock
            .acquire(&f.pool.to_string(), Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();
        f.holds
            .hold(&lease, f.pool, seats, booking, Duration::from_secs(600))
            .await
            .unwrap();
        f.lock.release(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_subtracts_bookings_and_holds() {
        let f = fixture(6);
        confirmed_booking(&f, vec![1, 2]).await;
        hold(&f, &[4], Uuid::new_v4()).await;

        let snapshot = f.calculator.snapshot(f.pool.route_id, f.pool.travel_date).await.unwrap();
        assert_eq!(snapshot.total, 6);
        assert_eq!(snapshot.seats, vec![3, 5, 6]);
        assert_eq!(snapshot.available, 3);
        assert_eq!(snapshot.booked, 2);
        assert_eq!(snapshot.held, 1);
        assert!(!snapshot.degraded);
    }

    #[tokio::test]
    async fn test_falls_back_to_durable_holds() {
        let f = fixture(4);
        hold(&f, &[2, 3], Uuid::new_v4()).await;
        f.fast.set_available(false);

        let snapshot = f.calculator.snapshot(f.pool.route_id, f.pool.travel_date).await.unwrap();
        assert_eq!(snapshot.seats, vec![1, 4]);
        assert!(snapshot.degraded);
    }

    #[tokio::test]
    async fn test_allocatable_includes_own_holds() {
        let f = fixture(4);
        let mine = Uuid::new_v4();
        hold(&f, &[1], mine).await;
        hold(&f, &[2], Uuid::new_v4()).await;

        let seats = f.calculator.allocatable_seats(f.pool, mine).await.unwrap();
        assert_eq!(seats, BTreeSet::from([1, 3, 4]));
        assert_eq!(f.calculator.available_count(f.pool.route_id, f.pool.travel_date).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_allocatable_skips_seat_evicted_from_fast_store() {
        let f = fixture(4);
        hold(&f, &[1], Uuid::new_v4()).await;
        f.fast.evict(&f.pool.seat_key(1));

        let seats = f.calculator.allocatable_seats(f.pool, Uuid::new_v4()).await.unwrap();
        assert_eq!(seats, BTreeSet::from([2, 3, 4]));

        let snapshot = f.calculator.snapshot(f.pool.route_id, f.pool.travel_date).await.unwrap();
        assert_eq!(snapshot.seats, vec![2, 3, 4]);
        assert!(!snapshot.degraded);
    }
}
