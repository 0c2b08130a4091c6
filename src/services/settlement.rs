//! Inbound webhook (IPN) handling. The provider delivers settlement results
//! at-least-once, signed; this module authenticates, deduplicates and applies
//! them atomically across the payment, the booking and every seat. The
//! response codes form the provider contract and are returned even on
//! internal errors, never as an unhandled fault.

use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::config::PaymentConfig;
use crate::error::{AppError, AppResult};
use crate::models::{BookingStatus, Payment, PaymentStatus};
use crate::services::booking::{fetch_booking, lock_booking, set_booking_status};
use crate::services::gateway::verify_signature;
use crate::services::notifier::{Notification, Notifier};
use crate::services::seat_ledger;

/// Provider response codes. "00" is the success family; everything else is a
/// defined failure category the provider retries on.
pub const RSP_SUCCESS: &str = "00";
pub const RSP_FAILED: &str = "01";
pub const RSP_ALREADY_PROCESSED: &str = "02";
pub const RSP_INVALID_AMOUNT: &str = "04";
pub const RSP_ERROR: &str = "99";

const REQUIRED_FIELDS: [&str; 9] = [
    "vnp_TmnCode",
    "vnp_Amount",
    "vnp_BankCode",
    "vnp_OrderInfo",
    "vnp_ResponseCode",
    "vnp_TransactionNo",
    "vnp_TransactionStatus",
    "vnp_TxnRef",
    "vnp_SecureHash",
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IpnResponse {
    #[serde(rename = "RspCode")]
    pub rsp_code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl IpnResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self { rsp_code: code.to_string(), message: message.into() }
    }
}

/// The authenticated, parsed webhook payload.
#[derive(Debug)]
pub struct WebhookFields {
    pub txn_ref: String,
    pub response_code: String,
    pub transaction_status: String,
    /// Amount as reported by the provider, scaled x100.
    pub amount_scaled: i64,
}

impl WebhookFields {
    /// The provider signals a settled, successful transaction only when both
    /// codes are "00".
    pub fn is_success(&self) -> bool {
        self.response_code == "00" && self.transaction_status == "00"
    }
}

/// Steps 1-3 of the pipeline plus field parsing: required fields, signature,
/// merchant id. Pure; no state is touched on rejection.
pub fn authenticate_webhook(
    params: &BTreeMap<String, String>,
    merchant_id: &str,
    secret: &str,
) -> Result<WebhookFields, IpnResponse> {
    for field in REQUIRED_FIELDS {
        if params.get(field).map_or(true, |v| v.is_empty()) {
            return Err(IpnResponse::new(RSP_ERROR, "Missing required parameters"));
        }
    }

    let received_hash = &params["vnp_SecureHash"];
    if !verify_signature(params, received_hash, secret) {
        warn!("webhook rejected: invalid signature");
        return Err(IpnResponse::new(RSP_ERROR, "Invalid signature"));
    }

    if params["vnp_TmnCode"] != merchant_id {
        warn!("webhook rejected: unknown merchant code");
        return Err(IpnResponse::new(RSP_ERROR, "Invalid merchant code"));
    }

    let amount_scaled: i64 = match params["vnp_Amount"].parse() {
        Ok(v) => v,
        Err(_) => return Err(IpnResponse::new(RSP_ERROR, "Invalid amount")),
    };

    Ok(WebhookFields {
        txn_ref: params["vnp_TxnRef"].clone(),
        response_code: params["vnp_ResponseCode"].clone(),
        transaction_status: params["vnp_TransactionStatus"].clone(),
        amount_scaled,
    })
}

#[derive(Clone)]
pub struct SettlementProcessor {
    pool: PgPool,
    merchant_id: String,
    secret: String,
    notifier: Notifier,
}

impl SettlementProcessor {
    pub fn new(pool: PgPool, payment: &PaymentConfig, notifier: Notifier) -> Self {
        Self {
            pool,
            merchant_id: payment.merchant_id.clone(),
            secret: payment.secret.clone(),
            notifier,
        }
    }

    /// Process one webhook delivery. Always yields a well-formed response;
    /// internal errors map to the generic failure code.
    pub async fn process(&self, params: BTreeMap<String, String>) -> IpnResponse {
        let fields = match authenticate_webhook(&params, &self.merchant_id, &self.secret) {
            Ok(fields) => fields,
            Err(resp) => return resp,
        };

        match self.apply(&fields).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(txn_ref = %fields.txn_ref, "settlement failed: {e}");
                IpnResponse::new(RSP_ERROR, "Internal error")
            }
        }
    }

    /// Steps 4-8: lookup, dedup, amount check, seat check, atomic outcome.
    async fn apply(&self, fields: &WebhookFields) -> AppResult<IpnResponse> {
        let mut tx = self.pool.begin().await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, booking_id, amount, status, order_ref, method, created_at, updated_at
            FROM payments
            WHERE order_ref = $1
            "#,
        )
        .bind(&fields.txn_ref)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(payment) = payment else {
            return Ok(IpnResponse::new(RSP_ERROR, "Payment not found"));
        };

        // Serialize against the reconciler and duplicate deliveries.
        lock_booking(&mut *tx, payment.booking_id).await?;

        if payment.status == PaymentStatus::Approved {
            return Ok(IpnResponse::new(RSP_ALREADY_PROCESSED, "Payment already processed"));
        }

        if fields.amount_scaled != payment.amount * 100 {
            warn!(
                order_ref = %payment.order_ref,
                reported = fields.amount_scaled,
                expected = payment.amount * 100,
                "webhook rejected: amount mismatch"
            );
            return Ok(IpnResponse::new(RSP_INVALID_AMOUNT, "Invalid amount"));
        }

        let booking = fetch_booking(&mut *tx, payment.booking_id).await?;
        let seats = seat_ledger::seats_of_booking(&mut *tx, booking.id).await?;
        if seats.is_empty() {
            error!(booking_id = %booking.id, "settlement reached a booking with no seats");
            return Ok(IpnResponse::new(RSP_ERROR, "No seats found for booking"));
        }

        if fields.is_success() {
            // The conditional PENDING -> APPROVED transition is the real
            // idempotency guard; a racing duplicate delivery loses here.
            let approved = sqlx::query(
                "UPDATE payments SET status = 'APPROVED', updated_at = NOW()
                 WHERE id = $1 AND status = 'PENDING'",
            )
            .bind(payment.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if approved == 0 {
                return Ok(IpnResponse::new(RSP_ALREADY_PROCESSED, "Payment already processed"));
            }

            set_booking_status(&mut *tx, booking.id, BookingStatus::Booked).await?;

            let moved = seat_ledger::finalize_booked(&mut *tx, booking.id).await?;
            if moved != seats.len() as u64 {
                // A half-applied outcome must never commit.
                return Err(AppError::InternalInconsistency(format!(
                    "finalized {moved} of {} seats for booking {}",
                    seats.len(),
                    booking.id
                )));
            }

            tx.commit().await?;

            info!(
                booking_id = %booking.id,
                order_ref = %payment.order_ref,
                seats = seats.len(),
                "payment approved, booking settled"
            );
            self.notifier.notify(Notification::PaymentApproved {
                account_id: booking.account_id,
                booking_id: booking.id,
                order_ref: payment.order_ref.clone(),
                amount: payment.amount,
            });

            Ok(IpnResponse::new(RSP_SUCCESS, "Success"))
        } else {
            let cancelled = sqlx::query(
                "UPDATE payments SET status = 'CANCELLED', updated_at = NOW()
                 WHERE id = $1 AND status = 'PENDING'",
            )
            .bind(payment.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if cancelled == 0 {
                return Ok(IpnResponse::new(RSP_ALREADY_PROCESSED, "Payment already processed"));
            }

            set_booking_status(&mut *tx, booking.id, BookingStatus::Cancelled).await?;
            let freed = seat_ledger::release(&mut *tx, booking.id).await?;

            tx.commit().await?;

            info!(
                booking_id = %booking.id,
                order_ref = %payment.order_ref,
                freed = freed.len(),
                "payment failed, booking cancelled"
            );
            Ok(IpnResponse::new(RSP_FAILED, "Fail"))
        }
    }
}
