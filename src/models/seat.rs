use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "seat_class", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SeatClass {
    Normal,
    Vip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "seat_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Available,
    Pending,
    Booked,
    NotAvailable,
}

/// Physical seat in a hall. Immutable once created; never deleted while a
/// show references it.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Seat {
    pub id: Uuid,
    pub hall_id: Uuid,
    pub row_num: i32,
    pub col_num: i32,
    pub seat_class: SeatClass,
    pub price: i64,
}

/// The bookable unit: one row per (show, seat) pair. `booking_id` links the
/// seat to the single live booking that owns it while PENDING or BOOKED.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ShowSeat {
    pub id: Uuid,
    pub show_id: Uuid,
    pub seat_id: Uuid,
    pub seat_index: String,
    pub status: SeatStatus,
    pub booking_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}
