use std::sync::Arc;

use ridepool_booking::{BookingController, CapacityCache, SeatInventory};
use ridepool_core::repository::FastStore;

#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<BookingController>,
    pub capacity: Arc<CapacityCache>,
    pub fast_store: Arc<dyn FastStore>,
}

impl AppState {
    pub fn new(inventory: &SeatInventory, fast_store: Arc<dyn FastStore>) -> Self {
        Self {
            bookings: inventory.controller.clone(),
            capacity: inventory.capacity.clone(),
            fast_store,
        }
    }
}
