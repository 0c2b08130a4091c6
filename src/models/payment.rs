use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Cancelled,
    Returned,
}

impl PaymentStatus {
    /// APPROVED is terminal-success, CANCELLED/RETURNED terminal-failure.
    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_method", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    Vnpay,
    Qr,
}

impl PaymentMethod {
    /// Gateway-redirect payments carry no local proof of outcome, so the
    /// reconciler must query the provider before finalizing them. QR
    /// transfers have no status endpoint at all.
    pub fn requires_remote_verification(self) -> bool {
        matches!(self, PaymentMethod::Vnpay)
    }
}

/// One settlement attempt against exactly one booking. `amount` is fixed at
/// creation from the booking's seat prices (minor units) and never changes;
/// `order_ref` is the external correlation id the webhook reports back.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub amount: i64,
    pub status: PaymentStatus,
    pub order_ref: String,
    pub method: PaymentMethod,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Approved.is_terminal());
        assert!(PaymentStatus::Cancelled.is_terminal());
        assert!(PaymentStatus::Returned.is_terminal());
    }

    #[test]
    fn only_gateway_payments_need_remote_verification() {
        assert!(PaymentMethod::Vnpay.requires_remote_verification());
        assert!(!PaymentMethod::Qr.requires_remote_verification());
    }
}
