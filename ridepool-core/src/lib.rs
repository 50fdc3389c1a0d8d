pub mod booking;
pub mod clock;
pub mod events;
pub mod hold;
pub mod payment;
pub mod repository;

pub use booking::{Booking, BookingStatus, ReserveSeats};
pub use clock::{Clock, SystemClock};
pub use hold::{HoldMetadata, ResourceKey, SeatHold};

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Seats unavailable: {0}")]
    Conflict(String),
    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),
    #[error("Lease on {0} expired before the write could commit")]
    LeaseLost(String),
    #[error("No active hold for booking {0}")]
    HoldNotFound(Uuid),
    #[error("Hold for booking {0} has expired")]
    HoldExpired(Uuid),
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Fast store unavailable: {0}")]
    FastStore(String),
    #[error("Durable store failure: {0}")]
    Durable(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl CoreError {
    /// Stable code returned to clients so they can tell "pick other seats"
    /// apart from "try again shortly".
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Conflict(_) => "SEATS_UNAVAILABLE",
            CoreError::LockTimeout(_) | CoreError::LeaseLost(_) => "SERVICE_BUSY",
            CoreError::HoldNotFound(_) => "HOLD_NOT_FOUND",
            CoreError::HoldExpired(_) => "HOLD_EXPIRED",
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::ValidationError(_) => "VALIDATION_FAILED",
            CoreError::FastStore(_) => "FAST_STORE_UNAVAILABLE",
            CoreError::Durable(_) => "STORAGE_FAILURE",
            CoreError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the same request may succeed if the caller simply retries it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::LockTimeout(_) | CoreError::LeaseLost(_) | CoreError::FastStore(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
