use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ridepool_core::repository::BookingRepository;
use ridepool_core::{BookingStatus, Clock, CoreResult};

use crate::hold_store::HoldStore;
use crate::lifecycle::BookingController;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub holds_released: usize,
    pub bookings_expired: usize,
    pub stale_pending_expired: usize,
    pub failures: usize,
}

impl ReconcileReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodic sweep that makes lapsed holds visible in the durable state.
///
/// Fast-store entries vanish on their own when a TTL runs out; the durable
/// rows and the owning bookings do not. Each pass releases expired durable
/// holds, expires the PENDING and HELD bookings they belonged to, and
/// expires PENDING bookings that never got a hold. Paid bookings keep their
/// status. Every write is conditional, so passes may overlap with each
/// other and with live traffic.
pub struct ExpiryReconciler {
    holds: Arc<HoldStore>,
    bookings: Arc<dyn BookingRepository>,
    controller: Arc<BookingController>,
    clock: Arc<dyn Clock>,
    batch_size: i64,
}

impl ExpiryReconciler {
    pub fn new(
        holds: Arc<HoldStore>,
        bookings: Arc<dyn BookingRepository>,
        controller: Arc<BookingController>,
        clock: Arc<dyn Clock>,
        batch_size: i64,
    ) -> Self {
        Self {
            holds,
            bookings,
            controller,
            clock,
            batch_size,
        }
    }

    /// One pass. A failure on a single hold or booking is logged and
    /// counted; the rest of the batch still runs.
    pub async fn run_once(&self) -> CoreResult<ReconcileReport> {
        let now = self.clock.now();
        let mut report = ReconcileReport::default();

        let expired = self.holds.expired_holds(now, self.batch_size).await?;
        let mut owners = BTreeSet::new();
        for hold in &expired {
            match self.holds.release_lapsed(hold).await {
                Ok(true) => report.holds_released += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to release lapsed hold {}: {}", hold.id, e);
                    report.failures += 1;
                }
            }
            owners.insert(hold.booking_id);
        }

        for booking_id in owners {
            match self.expire_owner(booking_id, now).await {
                Ok(true) => report.bookings_expired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to expire booking {}: {}", booking_id, e);
                    report.failures += 1;
                }
            }
        }

        for booking in self.bookings.find_stale_pending(now, self.batch_size).await? {
            let booking_id = booking.id;
            match self.controller.expire_booking(booking, "reservation never completed").await {
                Ok(Some(_)) => report.stale_pending_expired += 1,
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to expire stale booking {}: {}", booking_id, e);
                    report.failures += 1;
                }
            }
        }

        if report.is_empty() {
            debug!("Reconciler pass found nothing to do");
        } else {
            info!(
                "Reconciler pass: {} holds released, {} bookings expired, {} stale pending expired, {} failures",
                report.holds_released, report.bookings_expired, report.stale_pending_expired, report.failures
            );
        }
        Ok(report)
    }

    /// Expire the booking behind a lapsed hold, unless it has moved on or
    /// refreshed its hold since the row was read.
    async fn expire_owner(&self, booking_id: Uuid, now: DateTime<Utc>) -> CoreResult<bool> {
        match self.bookings.get(booking_id).await? {
            Some(booking)
                if matches!(booking.status, BookingStatus::Pending | BookingStatus::Held)
                    && booking.is_hold_expired(now) =>
            {
                Ok(self.controller.expire_booking(booking, "hold expired").await?.is_some())
            }
            Some(_) => Ok(false),
            None => {
                warn!("Lapsed hold references unknown booking {}", booking_id);
                Ok(false)
            }
        }
    }

    /// Run passes every `interval` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Expiry reconciler started, sweeping every {:?}", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Reconciler pass failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Expiry reconciler stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BookingPolicy, Ports, SeatInventory};
    use chrono::NaiveDate;
    use ridepool_core::repository::SeatHoldRepository;
    use ridepool_core::ReserveSeats;
    use ridepool_store::memory::{
        InMemoryBookingRepository, InMemoryFastStore, InMemorySeatHoldRepository, ManualClock, RecordingPaymentGateway,
        RecordingPublisher, StaticCapacity,
    };

    fn inventory(clock: Arc<ManualClock>, route: Uuid, capacity: u32) -> SeatInventory {
        let ports = Ports {
            fast_store: Arc::new(InMemoryFastStore::new(clock.clone())),
            bookings: Arc::new(InMemoryBookingRepository::new()),
            seat_holds: Arc::new(InMemorySeatHoldRepository::new()),
            capacity: Arc::new(StaticCapacity::with_route(route, capacity)),
            payments: Arc::new(RecordingPaymentGateway::new()),
            events: Arc::new(RecordingPublisher::new()),
            clock,
        };
        SeatInventory::new(ports, BookingPolicy::default())
    }

    fn request(route: Uuid, key: &str) -> ReserveSeats {
        ReserveSeats {
            rider_id: "rider-3".to_string(),
            route_id: route,
            travel_date: NaiveDate::from_ymd_opt(2026, 11, 5).unwrap(),
            seat_count: 2,
            seat_numbers: None,
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_pass_expires_lapsed_held_booking() {
        let clock = Arc::new(ManualClock::default());
        let route = Uuid::new_v4();
        let inv = inventory(clock.clone(), route, 4);
        let held = inv.controller.reserve_seats(request(route, "r-1")).await.unwrap();

        assert!(inv.reconciler.run_once().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(601));
        let report = inv.reconciler.run_once().await.unwrap();
        assert_eq!(report.holds_released, 2);
        assert_eq!(report.bookings_expired, 1);

        let booking = inv.controller.get_booking(held.id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Expired);
        assert_eq!(booking.failure_reason.as_deref(), Some("hold expired"));

        assert!(inv.reconciler.run_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paid_booking_keeps_status_when_hold_lapses() {
        let clock = Arc::new(ManualClock::default());
        let route = Uuid::new_v4();
        let inv = inventory(clock.clone(), route, 4);
        let held = inv.controller.reserve_seats(request(route, "r-2")).await.unwrap();
        inv.controller.mark_paid(held.id, "pay-9").await.unwrap();

        clock.advance(chrono::Duration::seconds(601));
        let report = inv.reconciler.run_once().await.unwrap();
        assert_eq!(report.holds_released, 2);
        assert_eq!(report.bookings_expired, 0);

        let booking = inv.controller.get_booking(held.id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Paid);
    }

    #[tokio::test]
    async fn test_booking_with_live_hold_is_not_expired() {
        let clock = Arc::new(ManualClock::default());
        let route = Uuid::new_v4();
        let seat_holds = Arc::new(InMemorySeatHoldRepository::new());
        let ports = Ports {
            fast_store: Arc::new(InMemoryFastStore::new(clock.clone())),
            bookings: Arc::new(InMemoryBookingRepository::new()),
            seat_holds: seat_holds.clone(),
            capacity: Arc::new(StaticCapacity::with_route(route, 4)),
            payments: Arc::new(RecordingPaymentGateway::new()),
            events: Arc::new(RecordingPublisher::new()),
            clock: clock.clone(),
        };
        let inv = SeatInventory::new(ports, BookingPolicy::default());
        let held = inv.controller.reserve_seats(request(route, "r-3")).await.unwrap();

        // A leftover row from an earlier attempt lapsed while the booking's
        // current hold is still live.
        let now = clock.now();
        let leftover = ridepool_core::SeatHold::new(
            route,
            held.travel_date,
            4,
            held.id,
            now - chrono::Duration::seconds(700),
            now - chrono::Duration::seconds(100),
        );
        seat_holds.insert_holds(&[leftover]).await.unwrap();

        let report = inv.reconciler.run_once().await.unwrap();
        assert_eq!(report.holds_released, 1);
        assert_eq!(report.bookings_expired, 0);
        assert_eq!(inv.controller.get_booking(held.id).await.unwrap().status, BookingStatus::Held);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::default());
        let inv = inventory(clock, Uuid::new_v4(), 4);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(inv.reconciler.clone().run(Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
