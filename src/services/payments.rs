//! Payment creation and lookup. A booking carries at most one live payment;
//! creating a new one while a PENDING or APPROVED payment exists is a
//! conflict. The amount is always derived from the reserved seats, never
//! taken from the request.

use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{BookingStatus, Payment, PaymentMethod};
use crate::services::booking::{fetch_booking, lock_booking, Caller};
use crate::services::gateway::PaymentGatewayClient;
use crate::services::seat_ledger;

#[derive(Debug, Serialize)]
pub struct PaymentWithLink {
    #[serde(flatten)]
    pub payment: Payment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pay_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_url: Option<String>,
}

#[derive(Clone)]
pub struct PaymentService {
    pool: PgPool,
    gateway: PaymentGatewayClient,
}

impl PaymentService {
    pub fn new(pool: PgPool, gateway: PaymentGatewayClient) -> Self {
        Self { pool, gateway }
    }

    /// Create a payment for a PENDING booking and hand back the link the
    /// client follows to pay (a signed redirect URL or a transfer QR image).
    pub async fn create_payment(
        &self,
        caller: &Caller,
        booking_id: Uuid,
        method: PaymentMethod,
        bank_code: Option<&str>,
        client_ip: &str,
    ) -> AppResult<PaymentWithLink> {
        let mut tx = self.pool.begin().await?;
        lock_booking(&mut *tx, booking_id).await?;

        let booking = fetch_booking(&mut *tx, booking_id).await?;
        if !caller.admin && booking.account_id != caller.account_id {
            return Err(AppError::Conflict(format!(
                "unauthorized access to booking {booking_id}"
            )));
        }
        if booking.status != BookingStatus::Pending {
            return Err(AppError::InvalidState(format!(
                "cannot pay for a {:?} booking",
                booking.status
            )));
        }

        let live_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM payments WHERE booking_id = $1 AND status <> 'CANCELLED')",
        )
        .bind(booking_id)
        .fetch_one(&mut *tx)
        .await?;
        if live_exists {
            return Err(AppError::Conflict(format!(
                "booking {booking_id} already has an active payment"
            )));
        }

        let amount = seat_ledger::booking_total(&mut *tx, booking_id).await?;
        if amount <= 0 {
            return Err(AppError::InvalidState(format!(
                "booking {booking_id} has no priced seats"
            )));
        }

        let order_ref = Uuid::new_v4().to_string();
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (booking_id, amount, status, order_ref, method)
            VALUES ($1, $2, 'PENDING', $3, $4)
            RETURNING id, booking_id, amount, status, order_ref, method, created_at, updated_at
            "#,
        )
        .bind(booking_id)
        .bind(amount)
        .bind(&order_ref)
        .bind(method)
        .fetch_one(&mut *tx)
        .await?;

        let (pay_url, qr_url) = match method {
            PaymentMethod::Vnpay => {
                match self.gateway.create_intent(&payment, bank_code, client_ip) {
                    Ok(url) => (Some(url), None),
                    Err(e) => {
                        // Keep the dead attempt as CANCELLED; the booking
                        // stays PENDING and a retry creates a fresh payment.
                        warn!(%booking_id, "payment intent failed: {e}");
                        sqlx::query(
                            "UPDATE payments SET status = 'CANCELLED', updated_at = NOW()
                             WHERE id = $1",
                        )
                        .bind(payment.id)
                        .execute(&mut *tx)
                        .await?;
                        tx.commit().await?;
                        return Err(e);
                    }
                }
            }
            PaymentMethod::Qr => (None, Some(self.gateway.qr_url(&payment))),
        };

        tx.commit().await?;
        info!(
            payment_id = %payment.id,
            %booking_id,
            amount,
            ?method,
            "payment created"
        );
        Ok(PaymentWithLink { payment, pay_url, qr_url })
    }

    pub async fn get_payment(&self, caller: &Caller, payment_id: Uuid) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, booking_id, amount, status, order_ref, method, created_at, updated_at
            FROM payments
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("payment {payment_id}")))?;

        if !caller.admin {
            let owner: Option<Uuid> =
                sqlx::query_scalar("SELECT account_id FROM bookings WHERE id = $1")
                    .bind(payment.booking_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if owner != Some(caller.account_id) {
                return Err(AppError::Conflict(format!(
                    "unauthorized access to payment {payment_id}"
                )));
            }
        }

        Ok(payment)
    }
}
