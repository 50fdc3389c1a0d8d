use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use ridepool_core::repository::SeatHoldRepository;
use ridepool_core::{CoreResult, SeatHold};

use crate::database::db_err;

const HOLD_COLUMNS: &str =
    "id, route_id, travel_date, seat_number, booking_id, held_at, expires_at, released_at";

/// Durable backup of seat holds in the `seat_holds` table
pub struct PgSeatHoldRepository {
    pool: PgPool,
}

impl PgSeatHoldRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SeatHoldRow {
    id: Uuid,
    route_id: Uuid,
    travel_date: NaiveDate,
    seat_number: i32,
    booking_id: Uuid,
    held_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    released_at: Option<DateTime<Utc>>,
}

impl From<SeatHoldRow> for SeatHold {
    fn from(row: SeatHoldRow) -> Self {
        SeatHold {
            id: row.id,
            route_id: row.route_id,
            travel_date: row.travel_date,
            seat_number: row.seat_number,
            booking_id: row.booking_id,
            held_at: row.held_at,
            expires_at: row.expires_at,
            released_at: row.released_at,
        }
    }
}

#[async_trait]
impl SeatHoldRepository for PgSeatHoldRepository {
    async fn insert_holds(&self, holds: &[SeatHold]) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for hold in holds {
            sqlx::query(
                r#"
                INSERT INTO seat_holds (id, route_id, travel_date, seat_number, booking_id, held_at, expires_at, released_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NULL)
                ON CONFLICT (route_id, travel_date, seat_number, booking_id)
                DO UPDATE SET held_at = EXCLUDED.held_at, expires_at = EXCLUDED.expires_at, released_at = NULL
                "#,
            )
            .bind(hold.id)
            .bind(hold.route_id)
            .bind(hold.travel_date)
            .bind(hold.seat_number)
            .bind(hold.booking_id)
            .bind(hold.held_at)
            .bind(hold.expires_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn release(&self, booking_id: Uuid, seats: &[i32], at: DateTime<Utc>) -> CoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE seat_holds SET released_at = $3
            WHERE booking_id = $1 AND seat_number = ANY($2) AND released_at IS NULL
            "#,
        )
        .bind(booking_id)
        .bind(seats.to_vec())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn release_hold(&self, hold_id: Uuid, at: DateTime<Utc>) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE seat_holds SET released_at = $2 WHERE id = $1 AND released_at IS NULL AND expires_at <= $2",
        )
        .bind(hold_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn extend(&self, booking_id: Uuid, expires_at: DateTime<Utc>) -> CoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE seat_holds SET expires_at = GREATEST(expires_at, $2)
            WHERE booking_id = $1 AND released_at IS NULL
            "#,
        )
        .bind(booking_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn active_for_pool(
        &self,
        route_id: Uuid,
        travel_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<SeatHold>> {
        let sql = format!(
            "SELECT {} FROM seat_holds \
             WHERE route_id = $1 AND travel_date = $2 AND released_at IS NULL AND expires_at > $3",
            HOLD_COLUMNS
        );
        let rows = sqlx::query_as::<_, SeatHoldRow>(&sql)
            .bind(route_id)
            .bind(travel_date)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(SeatHold::from).collect())
    }

    async fn for_booking(&self, booking_id: Uuid) -> CoreResult<Vec<SeatHold>> {
        let sql = format!(
            "SELECT {} FROM seat_holds WHERE booking_id = $1 ORDER BY seat_number",
            HOLD_COLUMNS
        );
        let rows = sqlx::query_as::<_, SeatHoldRow>(&sql)
            .bind(booking_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(SeatHold::from).collect())
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<SeatHold>> {
        let sql = format!(
            "SELECT {} FROM seat_holds WHERE released_at IS NULL AND expires_at <= $1 \
             ORDER BY expires_at LIMIT $2",
            HOLD_COLUMNS
        );
        let rows = sqlx::query_as::<_, SeatHoldRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(SeatHold::from).collect())
    }
}
