use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cinema_booking::{config::Config, services::reconciler::ExpiryReconciler, AppState};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.app.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting cinema booking service");

    let state = AppState::new(config.clone())
        .await
        .expect("Failed to initialize application state");
    info!("Database connected, migrations applied");

    // Background sweep for bookings the webhook never settled.
    let reconciler = ExpiryReconciler::new(
        state.db.pool.clone(),
        state.gateway.clone(),
        state.notifier.clone(),
        config.reconciler.clone(),
    );
    task::spawn(reconciler.run());

    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .nest("/api", cinema_booking::controllers::routes())
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .expect("HOST and PORT must form a valid socket address");
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listen address");
    axum::serve(listener, app.into_make_service())
        .await
        .expect("Server error");
}
