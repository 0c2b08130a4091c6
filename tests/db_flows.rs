//! End-to-end flows against a real Postgres instance. Run with a disposable
//! database:
//!
//!   DATABASE_URL=postgres://... cargo test -- --ignored
//!
//! Each test seeds its own hall, show and account, so the tests can share one
//! database and run in any order.

use std::collections::BTreeMap;

use sqlx::PgPool;
use uuid::Uuid;

use cinema_booking::config::{CircuitBreakerConfig, PaymentConfig, ReconcilerConfig};
use cinema_booking::services::accounts::AccountDirectory;
use cinema_booking::services::booking::{BookingManager, Caller};
use cinema_booking::services::gateway::{
    hmac_sha512_hex, signature_base, PaymentGatewayClient,
};
use cinema_booking::models::BookingStatus;
use cinema_booking::services::notifier::{Notification, Notifier};
use cinema_booking::services::payments::PaymentService;
use cinema_booking::services::reconciler::ExpiryReconciler;
use cinema_booking::services::settlement::SettlementProcessor;

const SECRET: &str = "testsecret";
const MERCHANT: &str = "TESTCODE";
const SEAT_PRICE: i64 = 50_000;

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.expect("database connection");
    sqlx::migrate!("./migrations").run(&pool).await.expect("migrations");
    pool
}

fn payment_config() -> PaymentConfig {
    PaymentConfig {
        merchant_id: MERCHANT.to_string(),
        secret: SECRET.to_string(),
        pay_url: "https://gateway.example/pay".to_string(),
        query_url: "https://gateway.example/query".to_string(),
        return_url: "https://shop.example/return".to_string(),
        bank_id: "970422".to_string(),
        bank_account_no: "0011001".to_string(),
        bank_account_name: "CINEMA".to_string(),
        request_timeout_secs: 5,
    }
}

fn gateway() -> PaymentGatewayClient {
    PaymentGatewayClient::from_config(
        &payment_config(),
        &CircuitBreakerConfig { failure_threshold: 5, open_timeout_secs: 60 },
    )
}

struct Fixture {
    account_id: Uuid,
    show_id: Uuid,
}

/// Seed an account, a hall with four seats (A1..A4) and one show.
async fn seed(pool: &PgPool) -> Fixture {
    let tag = Uuid::new_v4().simple().to_string();

    let account_id: Uuid = sqlx::query_scalar(
        "INSERT INTO accounts (username, email) VALUES ($1, $2) RETURNING id",
    )
    .bind(format!("user-{tag}"))
    .bind(format!("user-{tag}@example.com"))
    .fetch_one(pool)
    .await
    .unwrap();

    let hall_id: Uuid =
        sqlx::query_scalar("INSERT INTO halls (name) VALUES ($1) RETURNING id")
            .bind(format!("hall-{tag}"))
            .fetch_one(pool)
            .await
            .unwrap();

    let show_id: Uuid = sqlx::query_scalar(
        "INSERT INTO shows (hall_id, film_title, start_time)
         VALUES ($1, $2, NOW() + INTERVAL '1 day') RETURNING id",
    )
    .bind(hall_id)
    .bind(format!("film-{tag}"))
    .fetch_one(pool)
    .await
    .unwrap();

    for col in 1..=4i32 {
        let seat_id: Uuid = sqlx::query_scalar(
            "INSERT INTO seats (hall_id, row_num, col_num, price)
             VALUES ($1, 1, $2, $3) RETURNING id",
        )
        .bind(hall_id)
        .bind(col)
        .bind(SEAT_PRICE)
        .fetch_one(pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO show_seats (show_id, seat_id, seat_index)
             VALUES ($1, $2, $3)",
        )
        .bind(show_id)
        .bind(seat_id)
        .bind(format!("A{col}"))
        .execute(pool)
        .await
        .unwrap();
    }

    Fixture { account_id, show_id }
}

fn caller(account_id: Uuid) -> Caller {
    Caller { account_id, admin: false }
}

fn seats(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn seat_statuses(pool: &PgPool, show_id: Uuid) -> Vec<(String, String)> {
    sqlx::query_as(
        "SELECT seat_index, status::TEXT FROM show_seats WHERE show_id = $1 ORDER BY seat_index",
    )
    .bind(show_id)
    .fetch_all(pool)
    .await
    .unwrap()
}

fn signed_webhook(order_ref: &str, amount_scaled: i64, response_code: &str) -> BTreeMap<String, String> {
    let mut params: BTreeMap<String, String> = [
        ("vnp_TmnCode", MERCHANT.to_string()),
        ("vnp_Amount", amount_scaled.to_string()),
        ("vnp_BankCode", "NCB".to_string()),
        ("vnp_OrderInfo", format!("Payment for order {order_ref}")),
        ("vnp_ResponseCode", response_code.to_string()),
        ("vnp_TransactionNo", "14226112".to_string()),
        ("vnp_TransactionStatus", response_code.to_string()),
        ("vnp_TxnRef", order_ref.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let hash = hmac_sha512_hex(SECRET, &signature_base(&params));
    params.insert("vnp_SecureHash".to_string(), hash);
    params
}

fn settlement(pool: &PgPool) -> SettlementProcessor {
    let notifier = Notifier::spawn(16, AccountDirectory::new(pool.clone()));
    SettlementProcessor::new(pool.clone(), &payment_config(), notifier)
}

#[tokio::test]
#[ignore]
async fn concurrent_reservations_have_a_single_winner() {
    let pool = pool().await;
    let fx = seed(&pool).await;
    let manager = BookingManager::new(pool.clone());

    let other: Uuid = sqlx::query_scalar(
        "INSERT INTO accounts (username, email) VALUES ($1, $2) RETURNING id",
    )
    .bind(format!("rival-{}", Uuid::new_v4().simple()))
    .bind("rival@example.com")
    .fetch_one(&pool)
    .await
    .unwrap();

    let caller_a = caller(fx.account_id);
    let caller_b = caller(other);
    let seats_a = seats(&["A1", "A2"]);
    let seats_b = seats(&["A2", "A3"]);
    let (a, b) = tokio::join!(
        manager.create_booking(&caller_a, fx.show_id, &seats_a),
        manager.create_booking(&caller_b, fx.show_id, &seats_b),
    );

    assert!(
        a.is_ok() != b.is_ok(),
        "exactly one of the contending bookings must win A2"
    );

    let statuses = seat_statuses(&pool, fx.show_id).await;
    let pending = statuses.iter().filter(|(_, s)| s == "PENDING").count();
    assert_eq!(pending, 2, "only the winner's seats stay reserved");
}

#[tokio::test]
#[ignore]
async fn successful_webhook_settles_and_replays_are_idempotent() {
    let pool = pool().await;
    let fx = seed(&pool).await;
    let manager = BookingManager::new(pool.clone());
    let payments = PaymentService::new(pool.clone(), gateway());

    let booking = manager
        .create_booking(&caller(fx.account_id), fx.show_id, &seats(&["A1", "A2"]))
        .await
        .unwrap();
    let payment = payments
        .create_payment(
            &caller(fx.account_id),
            booking.booking.id,
            cinema_booking::models::PaymentMethod::Vnpay,
            None,
            "10.0.0.1",
        )
        .await
        .unwrap();
    assert_eq!(payment.payment.amount, 2 * SEAT_PRICE);
    assert!(payment.pay_url.is_some());

    let processor = settlement(&pool);
    let params = signed_webhook(&payment.payment.order_ref, 2 * SEAT_PRICE * 100, "00");

    let first = processor.process(params.clone()).await;
    assert_eq!(first.rsp_code, "00");

    let replay = processor.process(params).await;
    assert_eq!(replay.rsp_code, "02");

    let booking_status: String =
        sqlx::query_scalar("SELECT status::TEXT FROM bookings WHERE id = $1")
            .bind(booking.booking.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(booking_status, "BOOKED");

    let statuses = seat_statuses(&pool, fx.show_id).await;
    assert_eq!(statuses[0], ("A1".to_string(), "BOOKED".to_string()));
    assert_eq!(statuses[1], ("A2".to_string(), "BOOKED".to_string()));
    assert_eq!(statuses[2].1, "AVAILABLE");
}

#[tokio::test]
#[ignore]
async fn failed_webhook_cancels_and_releases_seats() {
    let pool = pool().await;
    let fx = seed(&pool).await;
    let manager = BookingManager::new(pool.clone());
    let payments = PaymentService::new(pool.clone(), gateway());

    let booking = manager
        .create_booking(&caller(fx.account_id), fx.show_id, &seats(&["A3"]))
        .await
        .unwrap();
    let payment = payments
        .create_payment(
            &caller(fx.account_id),
            booking.booking.id,
            cinema_booking::models::PaymentMethod::Vnpay,
            None,
            "10.0.0.1",
        )
        .await
        .unwrap();

    let processor = settlement(&pool);
    let params = signed_webhook(&payment.payment.order_ref, SEAT_PRICE * 100, "24");
    let resp = processor.process(params).await;
    assert_eq!(resp.rsp_code, "01");

    let booking_status: String =
        sqlx::query_scalar("SELECT status::TEXT FROM bookings WHERE id = $1")
            .bind(booking.booking.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(booking_status, "CANCELLED");

    let statuses = seat_statuses(&pool, fx.show_id).await;
    assert!(statuses.iter().all(|(_, s)| s == "AVAILABLE"));
}

#[tokio::test]
#[ignore]
async fn webhook_amount_mismatch_changes_nothing() {
    let pool = pool().await;
    let fx = seed(&pool).await;
    let manager = BookingManager::new(pool.clone());
    let payments = PaymentService::new(pool.clone(), gateway());

    let booking = manager
        .create_booking(&caller(fx.account_id), fx.show_id, &seats(&["A4"]))
        .await
        .unwrap();
    let payment = payments
        .create_payment(
            &caller(fx.account_id),
            booking.booking.id,
            cinema_booking::models::PaymentMethod::Vnpay,
            None,
            "10.0.0.1",
        )
        .await
        .unwrap();

    let processor = settlement(&pool);
    let params = signed_webhook(&payment.payment.order_ref, 999, "00");
    let resp = processor.process(params).await;
    assert_eq!(resp.rsp_code, "04");

    let payment_status: String =
        sqlx::query_scalar("SELECT status::TEXT FROM payments WHERE id = $1")
            .bind(payment.payment.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "PENDING");
}

#[tokio::test]
#[ignore]
async fn reconciler_finalizes_an_approved_payment_and_notifies() {
    let pool = pool().await;
    let fx = seed(&pool).await;
    let manager = BookingManager::new(pool.clone());
    let payments = PaymentService::new(pool.clone(), gateway());

    let booking = manager
        .create_booking(&caller(fx.account_id), fx.show_id, &seats(&["A1", "A2"]))
        .await
        .unwrap();
    let payment = payments
        .create_payment(
            &caller(fx.account_id),
            booking.booking.id,
            cinema_booking::models::PaymentMethod::Qr,
            None,
            "10.0.0.1",
        )
        .await
        .unwrap();

    // Payment approved but the booking transition was lost; the sweep must
    // repair it.
    sqlx::query("UPDATE payments SET status = 'APPROVED' WHERE id = $1")
        .bind(payment.payment.id)
        .execute(&pool)
        .await
        .unwrap();

    let (notifier, mut events) = Notifier::channel(16);
    let reconciler = ExpiryReconciler::new(
        pool.clone(),
        gateway(),
        notifier,
        ReconcilerConfig { sweep_interval_secs: 60, pending_timeout_secs: 300 },
    );
    reconciler.sweep().await.unwrap();

    let booking_status: String =
        sqlx::query_scalar("SELECT status::TEXT FROM bookings WHERE id = $1")
            .bind(booking.booking.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(booking_status, "BOOKED");

    let statuses = seat_statuses(&pool, fx.show_id).await;
    assert_eq!(statuses[0].1, "BOOKED");
    assert_eq!(statuses[1].1, "BOOKED");

    match events.try_recv().expect("a success notification must be emitted") {
        Notification::PaymentApproved { booking_id, amount, .. } => {
            assert_eq!(booking_id, booking.booking.id);
            assert_eq!(amount, 2 * SEAT_PRICE);
        }
        other => panic!("unexpected notification {other:?}"),
    }
}

#[tokio::test]
#[ignore]
async fn admin_cancelling_a_booked_booking_frees_its_seats() {
    let pool = pool().await;
    let fx = seed(&pool).await;
    let manager = BookingManager::new(pool.clone());
    let payments = PaymentService::new(pool.clone(), gateway());

    let booking = manager
        .create_booking(&caller(fx.account_id), fx.show_id, &seats(&["A1", "A2"]))
        .await
        .unwrap();
    let payment = payments
        .create_payment(
            &caller(fx.account_id),
            booking.booking.id,
            cinema_booking::models::PaymentMethod::Vnpay,
            None,
            "10.0.0.1",
        )
        .await
        .unwrap();

    let processor = settlement(&pool);
    let params = signed_webhook(&payment.payment.order_ref, 2 * SEAT_PRICE * 100, "00");
    assert_eq!(processor.process(params).await.rsp_code, "00");

    let admin = Caller { account_id: fx.account_id, admin: true };
    let updated = manager
        .update_booking(&admin, booking.booking.id, Some(BookingStatus::Cancelled), None)
        .await
        .unwrap();
    assert_eq!(updated.booking.status, BookingStatus::Cancelled);

    let statuses = seat_statuses(&pool, fx.show_id).await;
    assert!(
        statuses.iter().all(|(_, s)| s == "AVAILABLE"),
        "no seat may stay BOOKED under a cancelled booking"
    );

    let payment_status: String =
        sqlx::query_scalar("SELECT status::TEXT FROM payments WHERE id = $1")
            .bind(payment.payment.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "RETURNED");
}

#[tokio::test]
#[ignore]
async fn reconciler_expires_a_timed_out_unpaid_booking() {
    let pool = pool().await;
    let fx = seed(&pool).await;
    let manager = BookingManager::new(pool.clone());

    let booking = manager
        .create_booking(&caller(fx.account_id), fx.show_id, &seats(&["A1", "A2"]))
        .await
        .unwrap();

    // Backdate past the reservation window.
    sqlx::query("UPDATE bookings SET created_at = NOW() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(booking.booking.id)
        .execute(&pool)
        .await
        .unwrap();

    let notifier = Notifier::spawn(16, AccountDirectory::new(pool.clone()));
    let reconciler = ExpiryReconciler::new(
        pool.clone(),
        gateway(),
        notifier,
        ReconcilerConfig { sweep_interval_secs: 60, pending_timeout_secs: 300 },
    );
    reconciler.sweep().await.unwrap();

    let booking_status: String =
        sqlx::query_scalar("SELECT status::TEXT FROM bookings WHERE id = $1")
            .bind(booking.booking.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(booking_status, "CANCELLED");

    let statuses = seat_statuses(&pool, fx.show_id).await;
    assert!(statuses.iter().all(|(_, s)| s == "AVAILABLE"));

    let expired: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM booking_expirations WHERE booking_id = $1",
    )
    .bind(booking.booking.id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(expired, 1);
}
