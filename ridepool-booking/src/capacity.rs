use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use ridepool_core::repository::CapacityProvider;
use ridepool_core::{CoreError, CoreResult};

/// Route seat capacities, cached until the route service says they changed.
pub struct CapacityCache {
    provider: Arc<dyn CapacityProvider>,
    cache: RwLock<HashMap<Uuid, u32>>,
}

impl CapacityCache {
    pub fn new(provider: Arc<dyn CapacityProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn capacity(&self, route_id: Uuid) -> CoreResult<u32> {
        if let Some(capacity) = self.cache.read().await.get(&route_id) {
            return Ok(*capacity);
        }

        debug!("Capacity cache miss for route {}", route_id);
        let capacity = self
            .provider
            .seat_capacity(route_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("route {}", route_id)))?;

        self.cache.write().await.insert(route_id, capacity);
        Ok(capacity)
    }

    pub async fn invalidate(&self, route_id: Uuid) {
        if self.cache.write().await.remove(&route_id).is_some() {
            info!("Invalidated cached capacity for route {}", route_id);
        }
    }
}
