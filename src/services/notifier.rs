//! Fire-and-forget notification sink. Settlement and the reconciler push
//! events into a bounded channel; a single consumer task resolves the
//! recipient and hands the message to the (external) mail delivery. A full
//! channel drops the event with a warning instead of blocking a settlement
//! transaction.

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::accounts::AccountDirectory;

#[derive(Debug, Clone)]
pub enum Notification {
    PaymentApproved {
        account_id: Uuid,
        booking_id: Uuid,
        order_ref: String,
        amount: i64,
    },
    BookingExpired {
        account_id: Uuid,
        booking_id: Uuid,
    },
}

#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Spawns the consumer task and returns the sending handle.
    pub fn spawn(capacity: usize, accounts: AccountDirectory) -> Self {
        let (notifier, mut rx) = Self::channel(capacity);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                deliver(&accounts, event).await;
            }
        });

        notifier
    }

    /// The raw channel pair without a consumer. Callers that want to observe
    /// the emitted events (instead of delivering them) drain the receiver
    /// themselves.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn notify(&self, event: Notification) {
        if self.tx.try_send(event).is_err() {
            warn!("notification channel full, dropping event");
        }
    }
}

async fn deliver(accounts: &AccountDirectory, event: Notification) {
    match event {
        Notification::PaymentApproved { account_id, booking_id, order_ref, amount } => {
            match accounts.email_of(account_id).await {
                Ok(Some(email)) => {
                    // Mail delivery is an external collaborator; this is the
                    // hand-off point.
                    info!(%booking_id, %order_ref, amount, %email, "payment confirmation queued");
                }
                Ok(None) => warn!(%account_id, "no account for payment notification"),
                Err(e) => warn!(%account_id, "failed to resolve recipient: {e}"),
            }
        }
        Notification::BookingExpired { account_id, booking_id } => {
            info!(%booking_id, %account_id, "booking expired notification");
        }
    }
}
