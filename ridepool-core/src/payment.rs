use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CoreResult;

/// Signals sent by the payment service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PaymentSignal {
    #[serde(rename = "payment.confirmed")]
    PaymentConfirmed { booking_id: Uuid, payment_id: String },
    /// A payment attempt started; keep the seats a little longer.
    #[serde(rename = "hold.extend")]
    ExtendHold { booking_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefundRequest {
    pub booking_id: Uuid,
    pub payment_id: Option<String>,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

/// Outbound side of the payment collaborator
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Ask the payment service to refund a booking it has taken money for.
    async fn request_refund(&self, refund: &RefundRequest) -> CoreResult<()>;
}
