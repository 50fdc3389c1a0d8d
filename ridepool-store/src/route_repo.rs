use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use ridepool_core::repository::CapacityProvider;
use ridepool_core::{CoreError, CoreResult};

use crate::database::db_err;

/// Reads seat capacity from the route service's `routes` table.
pub struct PgCapacityProvider {
    pool: PgPool,
}

impl PgCapacityProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CapacityProvider for PgCapacityProvider {
    async fn seat_capacity(&self, route_id: Uuid) -> CoreResult<Option<u32>> {
        let capacity: Option<i32> = sqlx::query_scalar("SELECT seat_capacity FROM routes WHERE id = $1")
            .bind(route_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        capacity
            .map(|c| {
                u32::try_from(c).map_err(|_| {
                    CoreError::InternalError(format!("Route {} has negative capacity {}", route_id, c))
                })
            })
            .transpose()
    }
}
