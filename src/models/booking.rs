use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "booking_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum BookingStatus {
    Pending,
    Booked,
    Cancelled,
}

impl BookingStatus {
    /// Legal transitions for the booking state machine. BOOKED and CANCELLED
    /// are terminal except for the explicit admin override path, which still
    /// refuses the BOOKED -> PENDING regression.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        match (self, next) {
            (BookingStatus::Booked, BookingStatus::Pending) => false,
            (a, b) if a == b => false,
            (BookingStatus::Pending, _) => true,
            (BookingStatus::Booked, BookingStatus::Cancelled) => true,
            (BookingStatus::Cancelled, _) => false,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Booking {
    pub id: Uuid,
    pub account_id: Uuid,
    pub show_id: Uuid,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
