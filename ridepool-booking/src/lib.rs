//! Seat inventory for shared rides: pool locks, seat holds, availability,
//! the booking state machine and the expiry sweep.

pub mod availability;
pub mod capacity;
pub mod hold_store;
pub mod lifecycle;
pub mod lock;
pub mod reconciler;

use std::sync::Arc;

use ridepool_core::events::EventPublisher;
use ridepool_core::payment::PaymentGateway;
use ridepool_core::repository::{BookingRepository, CapacityProvider, FastStore, SeatHoldRepository};
use ridepool_core::Clock;

pub use availability::{Availability, AvailabilityCalculator};
pub use capacity::CapacityCache;
pub use hold_store::{HoldReceipt, HoldStore, ReleaseSummary};
pub use lifecycle::{BookingController, BookingPolicy};
pub use lock::{Lease, LockCoordinator};
pub use reconciler::{ExpiryReconciler, ReconcileReport};

/// Adapters the inventory runs against
#[derive(Clone)]
pub struct Ports {
    pub fast_store: Arc<dyn FastStore>,
    pub bookings: Arc<dyn BookingRepository>,
    pub seat_holds: Arc<dyn SeatHoldRepository>,
    pub capacity: Arc<dyn CapacityProvider>,
    pub payments: Arc<dyn PaymentGateway>,
    pub events: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
}

/// The wired components, sharing one hold store and capacity cache.
#[derive(Clone)]
pub struct SeatInventory {
    pub controller: Arc<BookingController>,
    pub reconciler: Arc<ExpiryReconciler>,
    pub capacity: Arc<CapacityCache>,
}

impl SeatInventory {
    pub fn new(ports: Ports, policy: BookingPolicy) -> Self {
        let lock = LockCoordinator::new(ports.fast_store.clone(), ports.clock.clone(), policy.lock_retry_interval);
        let holds = Arc::new(HoldStore::new(
            ports.fast_store.clone(),
            ports.seat_holds.clone(),
            lock.clone(),
            ports.clock.clone(),
        ));
        let capacity = Arc::new(CapacityCache::new(ports.capacity.clone()));
        let availability = Arc::new(AvailabilityCalculator::new(
            ports.bookings.clone(),
            holds.clone(),
            capacity.clone(),
        ));

        let batch_size = policy.reconcile_batch_size;
        let controller = Arc::new(BookingController::new(&ports, holds.clone(), availability, lock, policy));
        let reconciler = Arc::new(ExpiryReconciler::new(
            holds,
            ports.bookings.clone(),
            controller.clone(),
            ports.clock.clone(),
            batch_size,
        ));

        Self {
            controller,
            reconciler,
            capacity,
        }
    }
}
