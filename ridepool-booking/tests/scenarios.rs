use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use uuid::Uuid;

use ridepool_booking::{BookingPolicy, LockCoordinator, Ports, SeatInventory};
use ridepool_core::{BookingStatus, CoreError, ReserveSeats, ResourceKey};
use ridepool_store::memory::{
    InMemoryBookingRepository, InMemoryFastStore, InMemorySeatHoldRepository, ManualClock, RecordingPaymentGateway,
    RecordingPublisher, StaticCapacity,
};

struct Harness {
    clock: Arc<ManualClock>,
    fast: Arc<InMemoryFastStore>,
    bookings: Arc<InMemoryBookingRepository>,
    payments: Arc<RecordingPaymentGateway>,
    inventory: SeatInventory,
    route: Uuid,
    date: NaiveDate,
}

impl Harness {
    fn new(capacity: u32) -> Self {
        Self::with_policy(capacity, BookingPolicy::default())
    }

    fn with_policy(capacity: u32, policy: BookingPolicy) -> Self {
        let clock = Arc::new(ManualClock::default());
        let fast = Arc::new(InMemoryFastStore::new(clock.clone()));
        let bookings = Arc::new(InMemoryBookingRepository::new());
        let payments = Arc::new(RecordingPaymentGateway::new());
        let route = Uuid::new_v4();
        let ports = Ports {
            fast_store: fast.clone(),
            bookings: bookings.clone(),
            seat_holds: Arc::new(InMemorySeatHoldRepository::new()),
            capacity: Arc::new(StaticCapacity::with_route(route, capacity)),
            payments: payments.clone(),
            events: Arc::new(RecordingPublisher::new()),
            clock: clock.clone(),
        };
        Self {
            clock,
            fast,
            bookings,
            payments,
            inventory: SeatInventory::new(ports, policy),
            route,
            date: NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(),
        }
    }

    fn request(&self, seats: i32, key: &str) -> ReserveSeats {
        ReserveSeats {
            rider_id: format!("rider-{}", key),
            route_id: self.route,
            travel_date: self.date,
            seat_count: seats,
            seat_numbers: None,
            idempotency_key: key.to_string(),
        }
    }

    async fn available(&self) -> usize {
        self.inventory
            .controller
            .get_availability(self.route, self.date)
            .await
            .unwrap()
            .available
    }

    fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_riders_racing_for_the_last_seats() {
    let h = Harness::new(4);
    let controller = h.inventory.controller.clone();

    let first = tokio::spawn({
        let controller = controller.clone();
        let request = h.request(3, "race-a");
        async move { controller.reserve_seats(request).await }
    });
    let second = tokio::spawn({
        let controller = controller.clone();
        let request = h.request(3, "race-b");
        async move { controller.reserve_seats(request).await }
    });

    let results = vec![first.await.unwrap(), second.await.unwrap()];
    let held: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(CoreError::Conflict(_))))
        .count();

    assert_eq!(held.len(), 1);
    assert_eq!(conflicts, 1);
    assert_eq!(held[0].status, BookingStatus::Held);
    assert_eq!(held[0].seat_numbers.len(), 3);
    assert_eq!(h.available().await, 1);

    let statuses: HashSet<BookingStatus> = h.bookings.all().iter().map(|b| b.status).collect();
    assert_eq!(statuses, HashSet::from([BookingStatus::Held, BookingStatus::Failed]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_seats_are_never_double_held() {
    let h = Harness::new(10);
    let mut tasks = Vec::new();
    for i in 0..20 {
        let controller = h.inventory.controller.clone();
        let request = h.request(1, &format!("crowd-{}", i));
        tasks.push(tokio::spawn(async move { controller.reserve_seats(request).await }));
    }

    let mut seats = Vec::new();
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(booking) => seats.extend(booking.seat_numbers),
            Err(CoreError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    let unique: BTreeSet<i32> = seats.iter().copied().collect();
    assert_eq!(seats.len(), 10);
    assert_eq!(unique, (1..=10).collect::<BTreeSet<i32>>());
    assert_eq!(conflicts, 10);
    assert_eq!(h.available().await, 0);
}

#[tokio::test]
async fn test_lapsed_hold_expires_and_seats_return() {
    let h = Harness::new(4);
    let held = h.inventory.controller.reserve_seats(h.request(3, "lapse")).await.unwrap();
    assert_eq!(h.available().await, 1);

    h.advance_secs(601);
    assert_eq!(h.available().await, 4);

    let report = h.inventory.reconciler.run_once().await.unwrap();
    assert_eq!(report.holds_released, 3);
    assert_eq!(report.bookings_expired, 1);

    let booking = h.inventory.controller.get_booking(held.id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Expired);
    assert!(booking.expired_at.is_some());

    let next = h.inventory.controller.reserve_seats(h.request(4, "after-lapse")).await.unwrap();
    assert_eq!(next.seat_numbers, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_payment_confirms_and_seats_stay_taken() {
    let h = Harness::new(4);
    let held = h.inventory.controller.reserve_seats(h.request(2, "pay")).await.unwrap();

    let confirmed = h
        .inventory
        .controller
        .handle_payment_confirmed(held.id, "pay-100")
        .await
        .unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert_eq!(confirmed.payment_id.as_deref(), Some("pay-100"));
    assert!(confirmed.paid_at.is_some() && confirmed.confirmed_at.is_some());

    // The hold is gone but the confirmed booking keeps the seats.
    h.advance_secs(3600);
    let availability = h.inventory.controller.get_availability(h.route, h.date).await.unwrap();
    assert_eq!(availability.booked, 2);
    assert_eq!(availability.held, 0);
    assert_eq!(availability.seats, vec![3, 4]);
}

#[tokio::test]
async fn test_cancelling_confirmed_booking_frees_seats() {
    let h = Harness::new(4);
    let held = h.inventory.controller.reserve_seats(h.request(4, "full")).await.unwrap();
    h.inventory
        .controller
        .handle_payment_confirmed(held.id, "pay-200")
        .await
        .unwrap();
    assert_eq!(h.available().await, 0);

    let cancelled = h
        .inventory
        .controller
        .cancel_booking(held.id, "driver cancelled trip")
        .await
        .unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(h.available().await, 4);

    let refunds = h.payments.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].payment_id.as_deref(), Some("pay-200"));
}

#[tokio::test]
async fn test_replayed_request_returns_same_booking() {
    let h = Harness::new(4);
    let first = h.inventory.controller.reserve_seats(h.request(2, "same-key")).await.unwrap();
    let second = h.inventory.controller.reserve_seats(h.request(2, "same-key")).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.seat_numbers, second.seat_numbers);
    assert_eq!(h.bookings.all().len(), 1);
    assert_eq!(h.available().await, 2);
}

#[tokio::test]
async fn test_extension_is_bounded_and_never_shortens() {
    let h = Harness::new(4);
    let held = h.inventory.controller.reserve_seats(h.request(1, "extend")).await.unwrap();
    let held_at = held.held_at.unwrap();

    h.advance_secs(120);
    let extended = h.inventory.controller.extend_hold(held.id).await.unwrap();
    assert_eq!(extended.expires_at, Some(held_at + chrono::Duration::seconds(900)));

    h.advance_secs(60);
    let again = h.inventory.controller.extend_hold(held.id).await.unwrap();
    assert_eq!(again.expires_at, extended.expires_at);

    // Past the original ten minutes, inside the extension.
    h.advance_secs(500);
    let report = h.inventory.reconciler.run_once().await.unwrap();
    assert_eq!(report.bookings_expired, 0);
    assert_eq!(h.available().await, 3);

    let confirmed = h
        .inventory
        .controller
        .handle_payment_confirmed(held.id, "pay-300")
        .await
        .unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn test_seats_lost_while_paid_cancel_and_refund() {
    let h = Harness::new(2);
    let held = h.inventory.controller.reserve_seats(h.request(2, "slow-pay")).await.unwrap();
    h.inventory.controller.mark_paid(held.id, "pay-400").await.unwrap();

    h.advance_secs(601);
    h.inventory.reconciler.run_once().await.unwrap();
    let other = h.inventory.controller.reserve_seats(h.request(2, "fast-rider")).await.unwrap();
    assert_eq!(other.status, BookingStatus::Held);

    let result = h.inventory.controller.confirm(held.id).await;
    assert!(matches!(result, Err(CoreError::Conflict(_))));

    let booking = h.inventory.controller.get_booking(held.id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(h.payments.refunds().len(), 1);
    assert_eq!(h.available().await, 0);
}

#[tokio::test]
async fn test_fast_store_outage_leaves_booking_pending_until_retry() {
    let h = Harness::new(4);
    h.fast.set_available(false);

    let result = h.inventory.controller.reserve_seats(h.request(2, "outage")).await;
    let err = result.unwrap_err();
    assert!(err.is_retryable());

    let pending = h.bookings.all();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, BookingStatus::Pending);

    h.fast.set_available(true);
    let held = h.inventory.controller.reserve_seats(h.request(2, "outage")).await.unwrap();
    assert_eq!(held.id, pending[0].id);
    assert_eq!(held.status, BookingStatus::Held);
}

#[tokio::test]
async fn test_lock_timeout_then_stale_pending_is_expired() {
    let policy = BookingPolicy {
        lock_max_wait: Duration::from_millis(50),
        ..BookingPolicy::default()
    };
    let h = Harness::with_policy(4, policy);

    let pool = ResourceKey::new(h.route, h.date);
    let blocker = LockCoordinator::new(h.fast.clone(), h.clock.clone(), Duration::from_millis(5));
    let lease = blocker
        .acquire(&pool.to_string(), Duration::ZERO, Duration::from_secs(30))
        .await
        .unwrap();

    let result = h.inventory.controller.reserve_seats(h.request(1, "blocked")).await;
    assert!(matches!(result, Err(CoreError::LockTimeout(_))));
    blocker.release(&lease).await.unwrap();

    h.advance_secs(601);
    let report = h.inventory.reconciler.run_once().await.unwrap();
    assert_eq!(report.stale_pending_expired, 1);

    let booking = &h.bookings.all()[0];
    assert_eq!(booking.status, BookingStatus::Expired);
}

#[tokio::test]
async fn test_releasing_twice_is_harmless() {
    let h = Harness::new(3);
    let held = h.inventory.controller.reserve_seats(h.request(3, "twice")).await.unwrap();

    h.inventory.controller.cancel_booking(held.id, "first").await.unwrap();
    h.inventory.controller.cancel_booking(held.id, "second").await.unwrap();
    h.advance_secs(601);
    let report = h.inventory.reconciler.run_once().await.unwrap();

    assert_eq!(report.holds_released, 0);
    assert_eq!(h.available().await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_with_same_key_share_one_booking() {
    let h = Harness::new(4);
    let mut tasks = Vec::new();
    for _ in 0..5 {
        let controller = h.inventory.controller.clone();
        let request = h.request(2, "double-tap");
        tasks.push(tokio::spawn(async move { controller.reserve_seats(request).await }));
    }

    let mut bookings = Vec::new();
    for task in tasks {
        bookings.push(task.await.unwrap().unwrap());
    }

    let ids: HashSet<Uuid> = bookings.iter().map(|b| b.id).collect();
    assert_eq!(ids.len(), 1);
    assert!(bookings.iter().all(|b| b.seat_numbers == vec![1, 2]));
    assert_eq!(h.bookings.all().len(), 1);
    assert_eq!(h.bookings.all()[0].status, BookingStatus::Held);
    assert_eq!(h.available().await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_evicted_hold_entry_still_blocks_its_seat() {
    let h = Harness::new(4);
    let first = h.inventory.controller.reserve_seats(h.request(1, "early")).await.unwrap();
    assert_eq!(first.seat_numbers, vec![1]);
    h.fast.evict(&ResourceKey::new(h.route, h.date).seat_key(1));

    let controller = h.inventory.controller.clone();
    let a = tokio::spawn({
        let controller = controller.clone();
        let request = h.request(1, "late-a");
        async move { controller.reserve_seats(request).await }
    });
    let b = tokio::spawn({
        let controller = controller.clone();
        let request = h.request(1, "late-b");
        async move { controller.reserve_seats(request).await }
    });

    let mut seats: Vec<i32> = Vec::new();
    for task in [a, b] {
        let booking = task.await.unwrap().unwrap();
        assert_eq!(booking.status, BookingStatus::Held);
        seats.extend(booking.seat_numbers);
    }
    seats.sort_unstable();
    assert_eq!(seats, vec![2, 3]);
    assert_eq!(h.available().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_during_outage_is_retryable_and_frees_seats() {
    let h = Harness::new(2);
    let held = h.inventory.controller.reserve_seats(h.request(2, "stranded")).await.unwrap();

    h.fast.set_available(false);
    let err = h
        .inventory
        .controller
        .cancel_booking(held.id, "rider left")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::FastStore(_)));
    assert!(err.is_retryable());

    let availability = h.inventory.controller.get_availability(h.route, h.date).await.unwrap();
    assert!(availability.degraded);
    assert_eq!(availability.available, 0);

    h.fast.set_available(true);
    let cancelled = h
        .inventory
        .controller
        .cancel_booking(held.id, "rider left")
        .await
        .unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(h.available().await, 2);

    let next = h.inventory.controller.reserve_seats(h.request(2, "next-rider")).await.unwrap();
    assert_eq!(next.status, BookingStatus::Held);
    assert_eq!(next.seat_numbers, vec![1, 2]);
}
