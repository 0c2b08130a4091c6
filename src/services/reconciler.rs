//! Background sweep that finalizes bookings the webhook never settled. Every
//! interval it walks PENDING bookings: ones whose payment the provider
//! confirms get booked, timed-out or provider-rejected ones are cancelled and
//! their seats released. One broken booking never stops the sweep, and an
//! unreachable gateway leaves bookings untouched for the next pass.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ReconcilerConfig;
use crate::error::{AppError, AppResult};
use crate::models::{BookingStatus, Payment, PaymentMethod, PaymentStatus};
use crate::services::booking::{fetch_booking, lock_booking, set_booking_status};
use crate::services::gateway::{PaymentGatewayClient, RemoteStatus};
use crate::services::notifier::{Notification, Notifier};
use crate::services::seat_ledger;

/// What the sweep decided to do with one PENDING booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    Finalize,
    Cancel,
    AskGateway,
    Leave,
}

/// Decide from local state and the clock. A booking is only acted on once it
/// has timed out or its payment already left PENDING; a timed-out card
/// payment gets one remote status check before cancellation.
fn sweep_action(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout_secs: i64,
    payment: Option<(PaymentStatus, PaymentMethod)>,
) -> SweepAction {
    let timed_out = (now - created_at).num_seconds() >= timeout_secs;
    match payment {
        // The webhook approved the payment but the booking transition was
        // lost; repair it.
        Some((PaymentStatus::Approved, _)) => SweepAction::Finalize,
        Some((PaymentStatus::Cancelled | PaymentStatus::Returned, _)) => SweepAction::Cancel,
        Some((PaymentStatus::Pending, method))
            if timed_out && method.requires_remote_verification() =>
        {
            SweepAction::AskGateway
        }
        Some((PaymentStatus::Pending, _)) | None => {
            if timed_out {
                SweepAction::Cancel
            } else {
                SweepAction::Leave
            }
        }
    }
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    booking_id: Uuid,
    created_at: DateTime<Utc>,
    payment_id: Option<Uuid>,
    payment_status: Option<PaymentStatus>,
    payment_method: Option<PaymentMethod>,
}

pub struct ExpiryReconciler {
    pool: PgPool,
    gateway: PaymentGatewayClient,
    notifier: Notifier,
    config: ReconcilerConfig,
}

impl ExpiryReconciler {
    pub fn new(
        pool: PgPool,
        gateway: PaymentGatewayClient,
        notifier: Notifier,
        config: ReconcilerConfig,
    ) -> Self {
        Self { pool, gateway, notifier, config }
    }

    /// Run the sweep loop forever. Ticks never overlap; a long sweep delays
    /// the next one instead of stacking.
    pub async fn run(self) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.sweep_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(e) = self.sweep().await {
                error!("reconciler sweep failed: {e}");
            }
        }
    }

    pub async fn sweep(&self) -> AppResult<()> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT b.id AS booking_id,
                   b.created_at,
                   p.id AS payment_id,
                   p.status AS payment_status,
                   p.method AS payment_method
            FROM bookings b
            LEFT JOIN payments p ON p.booking_id = b.id AND p.status <> 'CANCELLED'
            WHERE b.status = 'PENDING'
            ORDER BY b.created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(());
        }
        info!(pending = rows.len(), "reconciler sweep started");

        let now = Utc::now();
        for row in rows {
            if let Err(e) = self.reconcile_one(&row, now).await {
                // Isolate the failure so the rest of the sweep proceeds.
                error!(booking_id = %row.booking_id, "failed to reconcile booking: {e}");
            }
        }
        Ok(())
    }

    async fn reconcile_one(&self, row: &PendingRow, now: DateTime<Utc>) -> AppResult<()> {
        let payment = row.payment_status.zip(row.payment_method);
        let action = match sweep_action(
            row.created_at,
            now,
            self.config.pending_timeout_secs,
            payment,
        ) {
            SweepAction::AskGateway => self.resolve_via_gateway(row).await?,
            other => other,
        };

        match action {
            SweepAction::Finalize => self.finalize(row.booking_id).await,
            SweepAction::Cancel => self.cancel(row.booking_id, row.payment_id).await,
            SweepAction::Leave | SweepAction::AskGateway => Ok(()),
        }
    }

    /// Ask the provider about a timed-out card payment still marked PENDING.
    /// An unreachable gateway resolves to Leave so the booking gets another
    /// chance next sweep; a provider that still reports the transaction as
    /// processing does not, the reservation window is over.
    async fn resolve_via_gateway(&self, row: &PendingRow) -> AppResult<SweepAction> {
        let Some(payment_id) = row.payment_id else {
            return Ok(SweepAction::Leave);
        };
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, booking_id, amount, status, order_ref, method, created_at, updated_at
            FROM payments
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_one(&self.pool)
        .await?;

        match self.gateway.verify_remote(&payment).await {
            Ok(RemoteStatus::Success) => Ok(SweepAction::Finalize),
            Ok(RemoteStatus::Failed | RemoteStatus::Pending) => Ok(SweepAction::Cancel),
            Err(AppError::GatewayUnavailable(reason)) => {
                warn!(booking_id = %row.booking_id, reason, "gateway unavailable, deferring");
                Ok(SweepAction::Leave)
            }
            Err(e) => Err(e),
        }
    }

    /// Approve the payment and book the seats, mirroring the webhook success
    /// path. The conditional updates make this a no-op if a concurrent
    /// webhook got there first.
    async fn finalize(&self, booking_id: Uuid) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_booking(&mut *tx, booking_id).await?;

        let booking = fetch_booking(&mut *tx, booking_id).await?;
        if booking.status != BookingStatus::Pending {
            return Ok(());
        }

        sqlx::query(
            "UPDATE payments SET status = 'APPROVED', updated_at = NOW()
             WHERE booking_id = $1 AND status = 'PENDING'",
        )
        .bind(booking_id)
        .execute(&mut *tx)
        .await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, booking_id, amount, status, order_ref, method, created_at, updated_at
            FROM payments
            WHERE booking_id = $1 AND status = 'APPROVED'
            "#,
        )
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await?;

        set_booking_status(&mut *tx, booking_id, BookingStatus::Booked).await?;
        let seats = seat_ledger::seats_of_booking(&mut *tx, booking_id).await?;
        let moved = seat_ledger::finalize_booked(&mut *tx, booking_id).await?;
        if moved != seats.len() as u64 {
            return Err(AppError::InternalInconsistency(format!(
                "finalized {moved} of {} seats for booking {booking_id}",
                seats.len()
            )));
        }

        tx.commit().await?;
        info!(%booking_id, "reconciler finalized booking");

        if let Some(payment) = payment {
            self.notifier.notify(Notification::PaymentApproved {
                account_id: booking.account_id,
                booking_id,
                order_ref: payment.order_ref,
                amount: payment.amount,
            });
        }
        Ok(())
    }

    /// Cancel a timed-out or provider-rejected booking, release the seats and
    /// record the expiry.
    async fn cancel(&self, booking_id: Uuid, payment_id: Option<Uuid>) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_booking(&mut *tx, booking_id).await?;

        let booking = fetch_booking(&mut *tx, booking_id).await?;
        if booking.status != BookingStatus::Pending {
            return Ok(());
        }

        if let Some(payment_id) = payment_id {
            sqlx::query(
                "UPDATE payments SET status = 'CANCELLED', updated_at = NOW()
                 WHERE id = $1 AND status = 'PENDING'",
            )
            .bind(payment_id)
            .execute(&mut *tx)
            .await?;
        }

        let freed = seat_ledger::release(&mut *tx, booking_id).await?;
        set_booking_status(&mut *tx, booking_id, BookingStatus::Cancelled).await?;

        sqlx::query("INSERT INTO booking_expirations (booking_id, account_id) VALUES ($1, $2)")
            .bind(booking_id)
            .bind(booking.account_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(%booking_id, freed = freed.len(), "reconciler expired booking");
        self.notifier.notify(Notification::BookingExpired {
            account_id: booking.account_id,
            booking_id,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const TIMEOUT: i64 = 300;

    #[test]
    fn fresh_booking_without_payment_is_left_alone() {
        let now = Utc::now();
        let action = sweep_action(now - Duration::seconds(30), now, TIMEOUT, None);
        assert_eq!(action, SweepAction::Leave);
    }

    #[test]
    fn unpaid_booking_expires_after_the_timeout() {
        let now = Utc::now();
        let action = sweep_action(now - Duration::seconds(360), now, TIMEOUT, None);
        assert_eq!(action, SweepAction::Cancel);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let now = Utc::now();
        let action = sweep_action(now - Duration::seconds(TIMEOUT), now, TIMEOUT, None);
        assert_eq!(action, SweepAction::Cancel);
    }

    #[test]
    fn timed_out_card_payment_triggers_a_remote_check() {
        let now = Utc::now();
        let action = sweep_action(
            now - Duration::seconds(360),
            now,
            TIMEOUT,
            Some((PaymentStatus::Pending, PaymentMethod::Vnpay)),
        );
        assert_eq!(action, SweepAction::AskGateway);
    }

    #[test]
    fn card_payment_within_the_window_is_not_polled() {
        let now = Utc::now();
        let action = sweep_action(
            now - Duration::seconds(100),
            now,
            TIMEOUT,
            Some((PaymentStatus::Pending, PaymentMethod::Vnpay)),
        );
        assert_eq!(action, SweepAction::Leave);
    }

    #[test]
    fn pending_transfer_payment_expires_on_the_clock() {
        let now = Utc::now();
        let within = sweep_action(
            now - Duration::seconds(100),
            now,
            TIMEOUT,
            Some((PaymentStatus::Pending, PaymentMethod::Qr)),
        );
        assert_eq!(within, SweepAction::Leave);

        let beyond = sweep_action(
            now - Duration::seconds(400),
            now,
            TIMEOUT,
            Some((PaymentStatus::Pending, PaymentMethod::Qr)),
        );
        assert_eq!(beyond, SweepAction::Cancel);
    }

    #[test]
    fn approved_payment_repairs_the_booking() {
        let now = Utc::now();
        let action = sweep_action(
            now - Duration::seconds(10),
            now,
            TIMEOUT,
            Some((PaymentStatus::Approved, PaymentMethod::Vnpay)),
        );
        assert_eq!(action, SweepAction::Finalize);
    }

    #[test]
    fn dead_payment_cancels_immediately() {
        let now = Utc::now();
        let action = sweep_action(
            now - Duration::seconds(10),
            now,
            TIMEOUT,
            Some((PaymentStatus::Returned, PaymentMethod::Vnpay)),
        );
        assert_eq!(action, SweepAction::Cancel);
    }
}
