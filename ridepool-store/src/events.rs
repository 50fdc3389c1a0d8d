use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{info, error};

use ridepool_core::events::{BookingEvent, EventPublisher};
use ridepool_core::payment::{PaymentGateway, RefundRequest};
use ridepool_core::{CoreError, CoreResult};

pub const REFUND_TOPIC: &str = "payments.refund_requested";

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!("Sent message to {}/{}: partition {} offset {}", topic, key, delivery.partition, delivery.offset);
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send message to {}: {}", topic, e);
                Err(e)
            }
        }
    }

    async fn publish_json<T: serde::Serialize + Sync>(&self, topic: &str, key: &str, value: &T) -> CoreResult<()> {
        let payload = serde_json::to_string(value)
            .map_err(|e| CoreError::InternalError(format!("Failed to encode {} payload: {}", topic, e)))?;

        self.publish(topic, key, &payload)
            .await
            .map_err(|e| CoreError::InternalError(format!("Kafka publish to {} failed: {}", topic, e)))
    }
}

#[async_trait]
impl EventPublisher for EventProducer {
    async fn publish(&self, event: &BookingEvent) -> CoreResult<()> {
        self.publish_json(&event.topic(), &event.booking_id.to_string(), event).await
    }
}

#[async_trait]
impl PaymentGateway for EventProducer {
    async fn request_refund(&self, refund: &RefundRequest) -> CoreResult<()> {
        self.publish_json(REFUND_TOPIC, &refund.booking_id.to_string(), refund).await
    }
}
