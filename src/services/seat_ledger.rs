//! Per-show seat inventory. Every transition out of AVAILABLE is a
//! conditional update checked through `rows_affected`, so concurrent callers
//! racing for the same seat serialize at the database row: exactly one
//! writer wins, the rest observe `SeatUnavailable`. A plain read-then-write
//! is never used here.

use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::ShowSeat;

/// Reserve every requested seat for `booking_id`, AVAILABLE -> PENDING.
///
/// All-or-nothing per request: the caller runs this inside a transaction, and
/// the first seat that cannot be taken aborts with an error so the rollback
/// returns every seat reserved earlier in the call to AVAILABLE.
pub async fn try_reserve(
    conn: &mut PgConnection,
    show_id: Uuid,
    booking_id: Uuid,
    seat_indexes: &[String],
) -> AppResult<Vec<Uuid>> {
    let mut reserved = Vec::with_capacity(seat_indexes.len());

    for index in seat_indexes {
        let seat_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE show_seats
            SET status = 'PENDING', booking_id = $1, updated_at = NOW()
            WHERE show_id = $2 AND seat_index = $3 AND status = 'AVAILABLE'
            RETURNING id
            "#,
        )
        .bind(booking_id)
        .bind(show_id)
        .bind(index)
        .fetch_optional(&mut *conn)
        .await?;

        match seat_id {
            Some(id) => reserved.push(id),
            None => {
                let exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM show_seats WHERE show_id = $1 AND seat_index = $2)",
                )
                .bind(show_id)
                .bind(index)
                .fetch_one(&mut *conn)
                .await?;

                return Err(if exists {
                    AppError::SeatUnavailable(index.clone())
                } else {
                    AppError::NotFound(format!("seat {index}"))
                });
            }
        }
    }

    Ok(reserved)
}

/// Release every PENDING seat of a booking back to AVAILABLE. Returns the
/// freed seat ids.
pub async fn release(conn: &mut PgConnection, booking_id: Uuid) -> AppResult<Vec<Uuid>> {
    let freed = sqlx::query_scalar(
        r#"
        UPDATE show_seats
        SET status = 'AVAILABLE', booking_id = NULL, updated_at = NOW()
        WHERE booking_id = $1 AND status = 'PENDING'
        RETURNING id
        "#,
    )
    .bind(booking_id)
    .fetch_all(conn)
    .await?;

    Ok(freed)
}

/// Release every seat of a booking back to AVAILABLE, PENDING and BOOKED
/// alike. Cancellation of an already-settled booking goes through here so no
/// seat is left BOOKED under a CANCELLED booking.
pub async fn release_all(conn: &mut PgConnection, booking_id: Uuid) -> AppResult<Vec<Uuid>> {
    let freed = sqlx::query_scalar(
        r#"
        UPDATE show_seats
        SET status = 'AVAILABLE', booking_id = NULL, updated_at = NOW()
        WHERE booking_id = $1 AND status IN ('PENDING', 'BOOKED')
        RETURNING id
        "#,
    )
    .bind(booking_id)
    .fetch_all(conn)
    .await?;

    Ok(freed)
}

/// Release a subset of a booking's PENDING seats, identified by seat index.
/// Used when a PENDING booking's seat set shrinks.
pub async fn release_indexes(
    conn: &mut PgConnection,
    booking_id: Uuid,
    seat_indexes: &[String],
) -> AppResult<Vec<Uuid>> {
    let freed = sqlx::query_scalar(
        r#"
        UPDATE show_seats
        SET status = 'AVAILABLE', booking_id = NULL, updated_at = NOW()
        WHERE booking_id = $1 AND seat_index = ANY($2) AND status = 'PENDING'
        RETURNING id
        "#,
    )
    .bind(booking_id)
    .bind(seat_indexes)
    .fetch_all(conn)
    .await?;

    Ok(freed)
}

/// Promote a booking's PENDING seats to BOOKED. Returns how many rows moved;
/// settlement fails its transaction when the count does not match the
/// booking's seat set, so a half-applied outcome never commits.
pub async fn finalize_booked(conn: &mut PgConnection, booking_id: Uuid) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE show_seats
        SET status = 'BOOKED', updated_at = NOW()
        WHERE booking_id = $1 AND status = 'PENDING'
        "#,
    )
    .bind(booking_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn available_count(conn: &mut PgConnection, show_id: Uuid) -> AppResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM show_seats WHERE show_id = $1 AND status = 'AVAILABLE'",
    )
    .bind(show_id)
    .fetch_one(conn)
    .await?;

    Ok(count)
}

/// The ordered seat set of a booking.
pub async fn seats_of_booking(
    conn: &mut PgConnection,
    booking_id: Uuid,
) -> AppResult<Vec<ShowSeat>> {
    let seats = sqlx::query_as::<_, ShowSeat>(
        r#"
        SELECT id, show_id, seat_id, seat_index, status, booking_id, updated_at
        FROM show_seats
        WHERE booking_id = $1
        ORDER BY seat_index
        "#,
    )
    .bind(booking_id)
    .fetch_all(conn)
    .await?;

    Ok(seats)
}

/// Sum of the underlying seat prices for a booking, in minor units.
pub async fn booking_total(conn: &mut PgConnection, booking_id: Uuid) -> AppResult<i64> {
    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(s.price), 0)::BIGINT
        FROM show_seats ss
        JOIN seats s ON s.id = ss.seat_id
        WHERE ss.booking_id = $1
        "#,
    )
    .bind(booking_id)
    .fetch_one(conn)
    .await?;

    Ok(total)
}
