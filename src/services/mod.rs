pub mod accounts;
pub mod booking;
pub mod gateway;
pub mod notifier;
pub mod payments;
pub mod reconciler;
pub mod seat_ledger;
pub mod settlement;
