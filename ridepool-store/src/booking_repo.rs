use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use ridepool_core::repository::BookingRepository;
use ridepool_core::{Booking, BookingStatus, CoreError, CoreResult};

use crate::database::db_err;

const BOOKING_COLUMNS: &str = "id, rider_id, route_id, travel_date, seat_count, seat_numbers, status, \
     idempotency_key, expires_at, payment_id, failure_reason, cancellation_reason, created_at, \
     updated_at, held_at, paid_at, confirmed_at, checked_in_at, completed_at, cancelled_at, \
     expired_at, failed_at";

pub struct PgBookingRepository {
    pool: PgPool,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    rider_id: String,
    route_id: Uuid,
    travel_date: NaiveDate,
    seat_count: i32,
    seat_numbers: Vec<i32>,
    status: String,
    idempotency_key: String,
    expires_at: Option<DateTime<Utc>>,
    payment_id: Option<String>,
    failure_reason: Option<String>,
    cancellation_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    held_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    confirmed_at: Option<DateTime<Utc>>,
    checked_in_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = CoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            rider_id: row.rider_id,
            route_id: row.route_id,
            travel_date: row.travel_date,
            seat_count: row.seat_count,
            seat_numbers: row.seat_numbers,
            status: row.status.parse()?,
            idempotency_key: row.idempotency_key,
            expires_at: row.expires_at,
            payment_id: row.payment_id,
            failure_reason: row.failure_reason,
            cancellation_reason: row.cancellation_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            held_at: row.held_at,
            paid_at: row.paid_at,
            confirmed_at: row.confirmed_at,
            checked_in_at: row.checked_in_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            expired_at: row.expired_at,
            failed_at: row.failed_at,
        })
    }
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn create(&self, booking: &Booking) -> CoreResult<Booking> {
        let sql = format!(
            r#"
            INSERT INTO bookings (id, rider_id, route_id, travel_date, seat_count, seat_numbers, status,
                                  idempotency_key, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {}
            "#,
            BOOKING_COLUMNS
        );

        let inserted = sqlx::query_as::<_, BookingRow>(&sql)
            .bind(booking.id)
            .bind(&booking.rider_id)
            .bind(booking.route_id)
            .bind(booking.travel_date)
            .bind(booking.seat_count)
            .bind(&booking.seat_numbers)
            .bind(booking.status.as_str())
            .bind(&booking.idempotency_key)
            .bind(booking.expires_at)
            .bind(booking.created_at)
            .bind(booking.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match inserted {
            Some(row) => row.try_into(),
            // Lost the race on the idempotency key: hand back the winner.
            None => self
                .find_by_idempotency_key(&booking.idempotency_key)
                .await?
                .ok_or_else(|| {
                    CoreError::Durable(format!(
                        "idempotency key {} conflicted but no booking was found",
                        booking.idempotency_key
                    ))
                }),
        }
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Booking>> {
        let sql = format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS);
        let row = sqlx::query_as::<_, BookingRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> CoreResult<Option<Booking>> {
        let sql = format!("SELECT {} FROM bookings WHERE idempotency_key = $1", BOOKING_COLUMNS);
        let row = sqlx::query_as::<_, BookingRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn update(&self, booking: &Booking, expected: BookingStatus) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bookings SET
                seat_numbers = $2, status = $3, expires_at = $4, payment_id = $5,
                failure_reason = $6, cancellation_reason = $7, updated_at = $8,
                held_at = $9, paid_at = $10, confirmed_at = $11, checked_in_at = $12,
                completed_at = $13, cancelled_at = $14, expired_at = $15, failed_at = $16
            WHERE id = $1 AND status = $17
            "#,
        )
        .bind(booking.id)
        .bind(&booking.seat_numbers)
        .bind(booking.status.as_str())
        .bind(booking.expires_at)
        .bind(&booking.payment_id)
        .bind(&booking.failure_reason)
        .bind(&booking.cancellation_reason)
        .bind(booking.updated_at)
        .bind(booking.held_at)
        .bind(booking.paid_at)
        .bind(booking.confirmed_at)
        .bind(booking.checked_in_at)
        .bind(booking.completed_at)
        .bind(booking.cancelled_at)
        .bind(booking.expired_at)
        .bind(booking.failed_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn occupied_seats(&self, route_id: Uuid, travel_date: NaiveDate) -> CoreResult<Vec<i32>> {
        sqlx::query_scalar::<_, i32>(
            r#"
            SELECT unnest(seat_numbers)
            FROM bookings
            WHERE route_id = $1 AND travel_date = $2 AND status IN ('CONFIRMED', 'CHECKED_IN')
            "#,
        )
        .bind(route_id)
        .bind(travel_date)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn find_stale_pending(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let sql = format!(
            "SELECT {} FROM bookings WHERE status = 'PENDING' AND expires_at <= $1 ORDER BY expires_at LIMIT $2",
            BOOKING_COLUMNS
        );
        let rows = sqlx::query_as::<_, BookingRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(Booking::try_from).collect()
    }
}
