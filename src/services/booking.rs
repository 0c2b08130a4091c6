//! Booking lifecycle: seat selection, seat-count limits, ownership checks and
//! seat-set mutation. All state-changing operations run in a transaction that
//! first takes a per-booking advisory lock, so the webhook settlement path and
//! the reconciler sweep never race on the same booking.

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Booking, BookingStatus, ShowSeat};
use crate::services::seat_ledger;

/// Upper bound on seats per booking, matching the ticket-counter policy.
pub const MAX_TICKETS: usize = 8;

/// Caller identity as resolved by the account directory. `admin` bypasses
/// ownership checks but never the state-transition rules.
#[derive(Debug, Clone)]
pub struct Caller {
    pub account_id: Uuid,
    pub admin: bool,
}

#[derive(Debug, Serialize)]
pub struct BookingWithSeats {
    #[serde(flatten)]
    pub booking: Booking,
    pub seats: Vec<ShowSeat>,
}

/// De-duplicate seat indexes preserving first-seen order, then enforce the
/// per-booking limit.
pub fn normalize_seat_indexes(seat_indexes: &[String]) -> AppResult<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let unique: Vec<String> = seat_indexes
        .iter()
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect();

    if unique.is_empty() {
        return Err(AppError::Validation("at least one seat is required".to_string()));
    }
    if unique.len() > MAX_TICKETS {
        return Err(AppError::MaxTicketsExceeded { requested: unique.len(), limit: MAX_TICKETS });
    }
    Ok(unique)
}

/// Serializes state-changing operations on one booking. Transaction-scoped,
/// released on commit or rollback.
pub async fn lock_booking(conn: &mut PgConnection, booking_id: Uuid) -> AppResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(booking_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn fetch_booking(conn: &mut PgConnection, booking_id: Uuid) -> AppResult<Booking> {
    sqlx::query_as::<_, Booking>(
        "SELECT id, account_id, show_id, status, created_at, updated_at FROM bookings WHERE id = $1",
    )
    .bind(booking_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("booking {booking_id}")))
}

fn ensure_owner(booking: &Booking, caller: &Caller) -> AppResult<()> {
    if !caller.admin && booking.account_id != caller.account_id {
        return Err(AppError::Conflict(format!(
            "unauthorized access to booking {}",
            booking.id
        )));
    }
    Ok(())
}

pub async fn set_booking_status(
    conn: &mut PgConnection,
    booking_id: Uuid,
    status: BookingStatus,
) -> AppResult<()> {
    sqlx::query("UPDATE bookings SET status = $1, updated_at = NOW() WHERE id = $2")
        .bind(status)
        .bind(booking_id)
        .execute(conn)
        .await?;
    Ok(())
}

#[derive(Clone)]
pub struct BookingManager {
    pool: PgPool,
}

impl BookingManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Reserve seats and create a PENDING booking, all-or-nothing.
    pub async fn create_booking(
        &self,
        caller: &Caller,
        show_id: Uuid,
        seat_indexes: &[String],
    ) -> AppResult<BookingWithSeats> {
        let indexes = normalize_seat_indexes(seat_indexes)?;

        let show_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM shows WHERE id = $1)")
                .bind(show_id)
                .fetch_one(&self.pool)
                .await?;
        if !show_exists {
            return Err(AppError::NotFound(format!("show {show_id}")));
        }

        let mut tx = self.pool.begin().await?;

        if seat_ledger::available_count(&mut *tx, show_id).await? == 0 {
            return Err(AppError::ShowFull);
        }

        let booking = sqlx::query_as::<_, Booking>(
            r#"
            INSERT INTO bookings (account_id, show_id, status)
            VALUES ($1, $2, 'PENDING')
            RETURNING id, account_id, show_id, status, created_at, updated_at
            "#,
        )
        .bind(caller.account_id)
        .bind(show_id)
        .fetch_one(&mut *tx)
        .await?;

        seat_ledger::try_reserve(&mut *tx, show_id, booking.id, &indexes).await?;
        let seats = seat_ledger::seats_of_booking(&mut *tx, booking.id).await?;

        tx.commit().await?;

        info!(booking_id = %booking.id, seats = seats.len(), "booking created");
        Ok(BookingWithSeats { booking, seats })
    }

    pub async fn get_booking(&self, caller: &Caller, booking_id: Uuid) -> AppResult<BookingWithSeats> {
        let mut conn = self.pool.acquire().await?;
        let booking = fetch_booking(&mut *conn, booking_id).await?;
        ensure_owner(&booking, caller)?;
        let seats = seat_ledger::seats_of_booking(&mut *conn, booking_id).await?;
        Ok(BookingWithSeats { booking, seats })
    }

    pub async fn list_bookings(&self, caller: &Caller) -> AppResult<Vec<Booking>> {
        let bookings = sqlx::query_as::<_, Booking>(
            r#"
            SELECT id, account_id, show_id, status, created_at, updated_at
            FROM bookings
            WHERE account_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(caller.account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookings)
    }

    /// Cancel a PENDING booking, releasing every seat back to AVAILABLE.
    pub async fn cancel_booking(&self, caller: &Caller, booking_id: Uuid) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_booking(&mut *tx, booking_id).await?;

        let booking = fetch_booking(&mut *tx, booking_id).await?;
        ensure_owner(&booking, caller)?;

        if booking.status != BookingStatus::Pending {
            return Err(AppError::InvalidState(format!(
                "booking {} is already {:?}",
                booking_id, booking.status
            )));
        }

        let freed = seat_ledger::release(&mut *tx, booking_id).await?;
        set_booking_status(&mut *tx, booking_id, BookingStatus::Cancelled).await?;

        tx.commit().await?;
        info!(booking_id = %booking_id, freed = freed.len(), "booking cancelled");
        Ok(())
    }

    /// Update a booking's status and/or seat set.
    ///
    /// Removed seats return to AVAILABLE, added seats pass the same
    /// conditional reservation as creation, kept seats are left untouched.
    pub async fn update_booking(
        &self,
        caller: &Caller,
        booking_id: Uuid,
        new_status: Option<BookingStatus>,
        new_seats: Option<Vec<String>>,
    ) -> AppResult<BookingWithSeats> {
        let mut tx = self.pool.begin().await?;
        lock_booking(&mut *tx, booking_id).await?;

        let booking = fetch_booking(&mut *tx, booking_id).await?;
        ensure_owner(&booking, caller)?;

        if !caller.admin && booking.status != BookingStatus::Pending {
            return Err(AppError::InvalidState(
                "only PENDING bookings can be updated".to_string(),
            ));
        }

        let mut status = booking.status;
        if let Some(next) = new_status {
            if next != status {
                if !status.can_transition_to(next) {
                    return Err(AppError::InvalidState(format!(
                        "cannot change {status:?} booking to {next:?}"
                    )));
                }
                if next == BookingStatus::Cancelled {
                    if new_seats.is_some() {
                        return Err(AppError::Validation(
                            "cannot update seats when cancelling a booking".to_string(),
                        ));
                    }
                    // Frees BOOKED seats too: an admin may cancel after
                    // settlement, and a CANCELLED booking must not keep
                    // seats out of inventory or a live payment attached.
                    seat_ledger::release_all(&mut *tx, booking_id).await?;
                    sqlx::query(
                        "UPDATE payments SET status = 'CANCELLED', updated_at = NOW()
                         WHERE booking_id = $1 AND status = 'PENDING'",
                    )
                    .bind(booking_id)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query(
                        "UPDATE payments SET status = 'RETURNED', updated_at = NOW()
                         WHERE booking_id = $1 AND status = 'APPROVED'",
                    )
                    .bind(booking_id)
                    .execute(&mut *tx)
                    .await?;
                }
                status = next;
            }
        }

        if let Some(requested) = new_seats {
            // Seat sets are only mutable while the booking is PENDING.
            if status != BookingStatus::Pending {
                return Err(AppError::InvalidState(format!(
                    "cannot update seats of a {status:?} booking"
                )));
            }

            let wanted = normalize_seat_indexes(&requested)?;
            let current = seat_ledger::seats_of_booking(&mut *tx, booking_id).await?;
            let current_indexes: Vec<String> =
                current.iter().map(|s| s.seat_index.clone()).collect();

            let removed: Vec<String> = current_indexes
                .iter()
                .filter(|i| !wanted.contains(i))
                .cloned()
                .collect();
            let added: Vec<String> = wanted
                .iter()
                .filter(|i| !current_indexes.contains(i))
                .cloned()
                .collect();

            if !removed.is_empty() {
                seat_ledger::release_indexes(&mut *tx, booking_id, &removed).await?;
            }
            if !added.is_empty() {
                seat_ledger::try_reserve(&mut *tx, booking.show_id, booking_id, &added).await?;
            }
        }

        set_booking_status(&mut *tx, booking_id, status).await?;
        let seats = seat_ledger::seats_of_booking(&mut *tx, booking_id).await?;
        tx.commit().await?;

        let mut booking = booking;
        booking.status = status;
        Ok(BookingWithSeats { booking, seats })
    }

    /// Admin-only status override for operational correction. The caller is
    /// responsible for reconciling seats when using this outside the normal
    /// flows; the BOOKED -> PENDING regression stays forbidden.
    pub async fn set_status(
        &self,
        caller: &Caller,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> AppResult<()> {
        if !caller.admin {
            return Err(AppError::Conflict("admin role required".to_string()));
        }

        let mut tx = self.pool.begin().await?;
        lock_booking(&mut *tx, booking_id).await?;

        let booking = fetch_booking(&mut *tx, booking_id).await?;
        if booking.status == BookingStatus::Booked && status == BookingStatus::Pending {
            return Err(AppError::InvalidState(
                "cannot change BOOKED booking to PENDING".to_string(),
            ));
        }

        set_booking_status(&mut *tx, booking_id, status).await?;
        tx.commit().await?;
        Ok(())
    }
}
