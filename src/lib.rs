pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod middleware;
pub mod models;
pub mod services;

use std::sync::Arc;

use anyhow::Context;

use services::accounts::AccountDirectory;
use services::booking::BookingManager;
use services::gateway::PaymentGatewayClient;
use services::notifier::Notifier;
use services::payments::PaymentService;
use services::settlement::SettlementProcessor;

const NOTIFICATION_QUEUE_CAPACITY: usize = 1024;

// Shared state for the whole application.
#[derive(Clone)]
pub struct AppState {
    pub db: database::Database,
    pub config: config::Config,
    pub accounts: AccountDirectory,
    pub bookings: BookingManager,
    pub payments: PaymentService,
    pub gateway: PaymentGatewayClient,
    pub settlement: SettlementProcessor,
    pub notifier: Notifier,
}

impl AppState {
    pub async fn new(config: config::Config) -> anyhow::Result<Arc<Self>> {
        let db = database::Database::new(&config.database.url, config.database.pool_size)
            .await
            .context("failed to connect to the database")?;
        db.run_migrations().await.context("failed to run migrations")?;

        let accounts = AccountDirectory::new(db.pool.clone());
        let notifier = Notifier::spawn(NOTIFICATION_QUEUE_CAPACITY, accounts.clone());
        let gateway = PaymentGatewayClient::from_config(&config.payment, &config.circuit_breaker);
        let bookings = BookingManager::new(db.pool.clone());
        let payments = PaymentService::new(db.pool.clone(), gateway.clone());
        let settlement =
            SettlementProcessor::new(db.pool.clone(), &config.payment, notifier.clone());

        Ok(Arc::new(Self {
            db,
            config,
            accounts,
            bookings,
            payments,
            gateway,
            settlement,
            notifier,
        }))
    }
}
