use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ridepool_core::booking::validate_seat_numbers;
use ridepool_core::repository::{FastStore, SeatHoldRepository};
use ridepool_core::{Clock, CoreError, CoreResult, HoldMetadata, ResourceKey, SeatHold};

use crate::lock::{Lease, LockCoordinator};

/// Seats now held for a booking
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldReceipt {
    pub booking_id: Uuid,
    pub route_id: Uuid,
    pub travel_date: NaiveDate,
    pub seat_numbers: Vec<i32>,
    pub held_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub ephemeral_removed: usize,
    pub durable_released: u64,
}

pub(crate) fn to_chrono(ttl: Duration) -> CoreResult<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|e| CoreError::InternalError(format!("Duration out of range: {}", e)))
}

/// Temporary seat reservations, kept twice.
///
/// The fast store carries one TTL'd entry per seat plus a metadata entry per
/// booking and is what availability reads. The durable table is the backup
/// the reconciler sweeps and the fallback when the fast store is down.
pub struct HoldStore {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn SeatHoldRepository>,
    lock: LockCoordinator,
    clock: Arc<dyn Clock>,
}

impl HoldStore {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn SeatHoldRepository>,
        lock: LockCoordinator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fast,
            durable,
            lock,
            clock,
        }
    }

    /// Hold `seats` for `booking_id`. Must be called under the pool's lease.
    ///
    /// Fails with `Conflict` if any seat is held by a different booking,
    /// `LeaseLost` if the lease lapsed before anything was written. Seats
    /// already held by the same booking are simply refreshed.
    pub async fn hold(
        &self,
        lease: &Lease,
        pool: ResourceKey,
        seats: &[i32],
        booking_id: Uuid,
        ttl: Duration,
    ) -> CoreResult<HoldReceipt> {
        if lease.key() != pool.to_string() {
            return Err(CoreError::InternalError(format!(
                "hold on {} attempted under lease for {}",
                pool,
                lease.key()
            )));
        }
        validate_seat_numbers(seats)?;

        let now = self.clock.now();
        let taken = self.find_conflicts(pool, seats, booking_id, now).await?;
        if !taken.is_empty() {
            return Err(CoreError::Conflict(format!("seats {:?} are held by another booking", taken)));
        }

        if !self.lock.is_held(lease).await? {
            return Err(CoreError::LeaseLost(pool.to_string()));
        }

        let refreshed: BTreeSet<i32> = self
            .durable
            .for_booking(booking_id)
            .await?
            .into_iter()
            .filter(|row| row.is_active(now) && row.route_id == pool.route_id && row.travel_date == pool.travel_date)
            .map(|row| row.seat_number)
            .collect();

        let expires_at = now + to_chrono(ttl)?;
        let rows: Vec<SeatHold> = seats
            .iter()
            .map(|seat| SeatHold::new(pool.route_id, pool.travel_date, *seat, booking_id, now, expires_at))
            .collect();
        self.durable.insert_holds(&rows).await?;

        let owner = booking_id.to_string();
        let metadata = HoldMetadata {
            booking_id,
            route_id: pool.route_id,
            travel_date: pool.travel_date,
            seat_numbers: seats.to_vec(),
            held_at: now,
            expires_at,
        };
        let mut entries: Vec<(String, String)> = seats.iter().map(|seat| (pool.seat_key(*seat), owner.clone())).collect();
        entries.push((ResourceKey::metadata_key(booking_id), encode(&metadata)?));

        if let Err(e) = self.fast.set_many(&entries, ttl).await {
            // Rows this booking already held keep their fast entries, so only
            // the newly activated ones are undone.
            let added: Vec<i32> = seats.iter().copied().filter(|s| !refreshed.contains(s)).collect();
            error!(
                "Fast store write failed for booking {}, rolling back durable holds {:?}: {}",
                booking_id, added, e
            );
            if !added.is_empty() {
                if let Err(rollback) = self.durable.release(booking_id, &added, now).await {
                    error!("Rollback of durable holds for booking {} failed: {}", booking_id, rollback);
                }
            }
            return Err(e);
        }

        info!("Held seats {:?} on {} for booking {} until {}", seats, pool, booking_id, expires_at);
        Ok(HoldReceipt {
            booking_id,
            route_id: pool.route_id,
            travel_date: pool.travel_date,
            seat_numbers: seats.to_vec(),
            held_at: now,
            expires_at,
        })
    }

    /// Drop the booking's holds on `seats` from both stores.
    ///
    /// Entries owned by other bookings are left alone and releasing an
    /// already released hold is a no-op. Durable rows are only released once
    /// the fast entries are gone: if the fast store is unreachable the rows
    /// stay active, so availability and the reconciler still see the seats
    /// until a retry or their expiry clears them.
    pub async fn release(&self, pool: ResourceKey, seats: &[i32], booking_id: Uuid) -> CoreResult<ReleaseSummary> {
        let ephemeral_removed = self.release_ephemeral(pool, seats, booking_id).await?;

        let durable_released = if seats.is_empty() {
            0
        } else {
            self.durable.release(booking_id, seats, self.clock.now()).await?
        };

        debug!(
            "Released booking {} on {}: {} fast entries, {} durable rows",
            booking_id, pool, ephemeral_removed, durable_released
        );
        Ok(ReleaseSummary {
            ephemeral_removed,
            durable_released,
        })
    }

    async fn release_ephemeral(&self, pool: ResourceKey, seats: &[i32], booking_id: Uuid) -> CoreResult<usize> {
        let owner = booking_id.to_string();
        let mut removed = 0;
        for seat in seats {
            if self.fast.delete_if_eq(&pool.seat_key(*seat), &owner).await? {
                removed += 1;
            }
        }
        self.fast.delete(&ResourceKey::metadata_key(booking_id)).await?;
        Ok(removed)
    }

    /// Push the booking's hold out to `now + new_ttl` and return the new
    /// expiry. An extension that would not move the expiry forward leaves
    /// the hold untouched and returns the current expiry.
    ///
    /// Seat entries the fast store dropped early are re-created when still
    /// free; a seat taken by someone else in the meantime is a `Conflict`.
    pub async fn extend(&self, booking_id: Uuid, new_ttl: Duration) -> CoreResult<DateTime<Utc>> {
        let mut metadata = self.metadata(booking_id).await?.ok_or(CoreError::HoldNotFound(booking_id))?;

        let now = self.clock.now();
        let candidate = now + to_chrono(new_ttl)?;
        if candidate <= metadata.expires_at {
            debug!(
                "Hold for booking {} already runs until {}, not shortening it",
                booking_id, metadata.expires_at
            );
            return Ok(metadata.expires_at);
        }

        let pool = ResourceKey::new(metadata.route_id, metadata.travel_date);
        let owner = booking_id.to_string();
        for seat in &metadata.seat_numbers {
            let key = pool.seat_key(*seat);
            if self.fast.expire_if_eq(&key, &owner, new_ttl).await? {
                continue;
            }
            if !self.fast.set_nx(&key, &owner, new_ttl).await? {
                return Err(CoreError::Conflict(format!(
                    "seat {} on {} was taken before the hold could be extended",
                    seat, pool
                )));
            }
            warn!("Re-created missing hold entry for seat {} of booking {}", seat, booking_id);
        }

        metadata.expires_at = candidate;
        self.fast
            .set_many(&[(ResourceKey::metadata_key(booking_id), encode(&metadata)?)], new_ttl)
            .await?;
        self.durable.extend(booking_id, candidate).await?;

        info!("Extended hold for booking {} until {}", booking_id, candidate);
        Ok(candidate)
    }

    pub async fn metadata(&self, booking_id: Uuid) -> CoreResult<Option<HoldMetadata>> {
        match self.fast.get(&ResourceKey::metadata_key(booking_id)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CoreError::InternalError(format!("Corrupt hold metadata for {}: {}", booking_id, e))),
            None => Ok(None),
        }
    }

    /// Seat number to owning booking for every live fast-store hold in the pool.
    pub async fn holders(&self, pool: ResourceKey) -> CoreResult<BTreeMap<i32, String>> {
        let entries = self.fast.scan_prefix(&pool.seat_prefix()).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, owner)| pool.parse_seat_key(&key).map(|seat| (seat, owner)))
            .collect())
    }

    pub async fn list_held_seats(&self, pool: ResourceKey) -> CoreResult<BTreeSet<i32>> {
        Ok(self.holders(pool).await?.into_keys().collect())
    }

    /// Held seats according to the durable backup only.
    pub async fn durable_active_seats(&self, pool: ResourceKey) -> CoreResult<BTreeSet<i32>> {
        let now = self.clock.now();
        let rows = self.durable.active_for_pool(pool.route_id, pool.travel_date, now).await?;
        Ok(rows.into_iter().map(|row| row.seat_number).collect())
    }

    /// Seat number and owning booking for every active durable row in the pool.
    pub async fn durable_holders(&self, pool: ResourceKey) -> CoreResult<Vec<(i32, Uuid)>> {
        let now = self.clock.now();
        let rows = self.durable.active_for_pool(pool.route_id, pool.travel_date, now).await?;
        Ok(rows.into_iter().map(|row| (row.seat_number, row.booking_id)).collect())
    }

    pub async fn durable_holds_for(&self, booking_id: Uuid) -> CoreResult<Vec<SeatHold>> {
        self.durable.for_booking(booking_id).await
    }

    /// Seats among `seats` held by any booking other than `booking_id`, in
    /// either store.
    pub async fn find_conflicts(
        &self,
        pool: ResourceKey,
        seats: &[i32],
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<i32>> {
        let owner = booking_id.to_string();
        let keys: Vec<String> = seats.iter().map(|seat| pool.seat_key(*seat)).collect();
        let current = self.fast.get_many(&keys).await?;

        let mut taken: BTreeSet<i32> = seats
            .iter()
            .zip(current.iter())
            .filter(|(_, holder)| matches!(holder, Some(h) if *h != owner))
            .map(|(seat, _)| *seat)
            .collect();

        let durable = self.durable.active_for_pool(pool.route_id, pool.travel_date, now).await?;
        for row in durable {
            if row.booking_id != booking_id && seats.contains(&row.seat_number) && taken.insert(row.seat_number) {
                warn!(
                    "Seat {} on {} is held by booking {} in the durable backup only",
                    row.seat_number, pool, row.booking_id
                );
            }
        }

        Ok(taken.into_iter().collect())
    }

    /// Release one expired durable row and any matching fast-store entry.
    ///
    /// A row the owner refreshed after it was read is no longer expired; it
    /// is left alone along with its fast entry.
    pub async fn release_lapsed(&self, hold: &SeatHold) -> CoreResult<bool> {
        let released = self.durable.release_hold(hold.id, self.clock.now()).await?;
        if !released {
            return Ok(false);
        }

        let pool = ResourceKey::new(hold.route_id, hold.travel_date);
        let owner = hold.booking_id.to_string();
        if let Err(e) = self.fast.delete_if_eq(&pool.seat_key(hold.seat_number), &owner).await {
            warn!("Could not clear fast entry for lapsed hold {}: {}", hold.id, e);
        }
        Ok(true)
    }

    pub async fn expired_holds(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<SeatHold>> {
        self.durable.find_expired(now, limit).await
    }
}

fn encode(metadata: &HoldMetadata) -> CoreResult<String> {
    serde_json::to_string(metadata).map_err(|e| CoreError::InternalError(format!("Failed to encode hold metadata: {}", e)))
}
