//! Outbound side of the payment gateway integration: building the signed
//! redirect URL for a payment intent and querying the provider's
//! status-check endpoint. The inbound webhook never calls out from here; it
//! already carries signed proof and is handled by the settlement processor.
//!
//! Network calls go through a circuit breaker so a dead gateway cannot stall
//! every reconciler sweep.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha512;
use tracing::{info, warn};

use crate::config::{CircuitBreakerConfig, PaymentConfig};
use crate::error::{AppError, AppResult};
use crate::models::Payment;

pub const GATEWAY_VERSION: &str = "2.1.0";
const SECURE_HASH_FIELD: &str = "vnp_SecureHash";
const DATE_FORMAT: &str = "%Y%m%d%H%M%S";

/// The provider timestamps everything in UTC+7.
fn gateway_tz() -> FixedOffset {
    FixedOffset::east_opt(7 * 3600).expect("valid fixed offset")
}

fn format_gateway_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&gateway_tz()).format(DATE_FORMAT).to_string()
}

/// Lowercase hex HMAC-SHA-512 of `data` under the shared secret.
pub fn hmac_sha512_hex(secret: &str, data: &str) -> String {
    let mut mac =
        Hmac::<Sha512>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// The string every signature is computed over: parameters sorted
/// lexicographically by key, empty values skipped, each key and value
/// URL-encoded, joined as `key=value` with `&`. The signature field itself is
/// never part of its own hash.
pub fn signature_base(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .filter(|(k, v)| k.as_str() != SECURE_HASH_FIELD && !v.is_empty())
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Recompute the hash over everything except the received signature and
/// compare. Mismatch means tampering or forgery, never a transient error.
pub fn verify_signature(params: &BTreeMap<String, String>, received: &str, secret: &str) -> bool {
    hmac_sha512_hex(secret, &signature_base(params)) == received.to_lowercase()
}

/// Remote status-check outcome, reduced to what the reconciler branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Success,
    Pending,
    Failed,
}

#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    #[serde(rename = "vnp_ResponseCode")]
    pub response_code: Option<String>,
    #[serde(rename = "vnp_TxnRef")]
    pub txn_ref: Option<String>,
    #[serde(rename = "vnp_Amount")]
    pub amount: Option<String>,
    #[serde(rename = "vnp_TransactionType")]
    pub transaction_type: Option<String>,
    #[serde(rename = "vnp_TransactionStatus")]
    pub transaction_status: Option<String>,
    #[serde(rename = "vnp_Message")]
    pub message: Option<String>,
}

/// Map a status-check response onto the settlement outcome. Ambiguity leans
/// Pending so the reconciler retries on a later sweep instead of cancelling a
/// payment the provider may still settle.
pub fn map_query_response(resp: &QueryResponse, payment: &Payment) -> RemoteStatus {
    if resp.response_code.as_deref() != Some("00") {
        return RemoteStatus::Pending;
    }
    if resp.txn_ref.as_deref() != Some(payment.order_ref.as_str()) {
        return RemoteStatus::Pending;
    }
    let reported: Option<i64> = resp.amount.as_deref().and_then(|a| a.parse().ok());
    if reported != Some(payment.amount * 100) {
        return RemoteStatus::Failed;
    }
    if resp.transaction_type.as_deref() != Some("01") {
        return RemoteStatus::Failed;
    }
    match resp.transaction_status.as_deref() {
        Some("01") => RemoteStatus::Pending,
        Some("00") => RemoteStatus::Success,
        _ => RemoteStatus::Failed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
}

/// Gate on consecutive outbound failures: after `failure_threshold` the
/// breaker opens and blocks calls until `open_timeout` has passed, then lets
/// one probe through.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    open_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_timeout_secs: u64) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
            failure_threshold,
            open_timeout: Duration::from_secs(open_timeout_secs),
        }
    }

    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!("circuit breaker transitioning to half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            info!("circuit breaker recovered, closing");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed if inner.failures >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(failures = inner.failures, "circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!("circuit breaker probe failed, reopening");
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }
}

/// Client for the external payment gateway.
#[derive(Clone)]
pub struct PaymentGatewayClient {
    config: PaymentConfig,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl PaymentGatewayClient {
    pub fn from_config(payment: &PaymentConfig, breaker: &CircuitBreakerConfig) -> Self {
        Self {
            config: payment.clone(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(payment.request_timeout_secs))
                .build()
                .expect("failed to create HTTP client"),
            breaker: Arc::new(CircuitBreaker::new(
                breaker.failure_threshold,
                breaker.open_timeout_secs,
            )),
        }
    }

    /// Build the signed redirect URL for a gateway-hosted payment page.
    pub fn create_intent(
        &self,
        payment: &Payment,
        bank_code: Option<&str>,
        client_ip: &str,
    ) -> AppResult<String> {
        if payment.amount <= 0 {
            return Err(AppError::Validation("payment amount must be positive".to_string()));
        }

        let now = Utc::now();
        let mut params = BTreeMap::new();
        params.insert("vnp_Version".to_string(), GATEWAY_VERSION.to_string());
        params.insert("vnp_Command".to_string(), "pay".to_string());
        params.insert("vnp_TmnCode".to_string(), self.config.merchant_id.clone());
        params.insert("vnp_Amount".to_string(), (payment.amount * 100).to_string());
        params.insert("vnp_CurrCode".to_string(), "VND".to_string());
        params.insert("vnp_TxnRef".to_string(), payment.order_ref.clone());
        params.insert(
            "vnp_OrderInfo".to_string(),
            format!("Payment for order {}", payment.order_ref),
        );
        params.insert("vnp_OrderType".to_string(), "other".to_string());
        params.insert("vnp_Locale".to_string(), "vn".to_string());
        params.insert("vnp_IpAddr".to_string(), client_ip.to_string());
        params.insert("vnp_ReturnUrl".to_string(), self.config.return_url.clone());
        params.insert("vnp_CreateDate".to_string(), format_gateway_time(now));
        params.insert(
            "vnp_ExpireDate".to_string(),
            format_gateway_time(now + chrono::Duration::minutes(15)),
        );
        if let Some(bank) = bank_code {
            if !bank.is_empty() {
                params.insert("vnp_BankCode".to_string(), bank.to_string());
            }
        }

        let query = signature_base(&params);
        let hash = hmac_sha512_hex(&self.config.secret, &query);
        Ok(format!("{}?{}&{}={}", self.config.pay_url, query, SECURE_HASH_FIELD, hash))
    }

    /// Static bank-transfer QR image for payments settled by matching the
    /// order reference in the transfer note. Nothing to sign, nothing to
    /// verify remotely.
    pub fn qr_url(&self, payment: &Payment) -> String {
        format!(
            "https://img.vietqr.io/image/{}-{}-compact2.png?amount={}&addInfo={}&accountName={}",
            self.config.bank_id,
            self.config.bank_account_no,
            payment.amount,
            urlencoding::encode(&payment.order_ref),
            urlencoding::encode(&self.config.bank_account_name),
        )
    }

    pub fn merchant_id(&self) -> &str {
        &self.config.merchant_id
    }

    pub fn secret(&self) -> &str {
        &self.config.secret
    }

    /// Query the provider's status-check endpoint for a payment. Used only by
    /// the reconciler; bounded by the client timeout and the circuit breaker.
    pub async fn verify_remote(&self, payment: &Payment) -> AppResult<RemoteStatus> {
        if !self.breaker.can_execute() {
            return Err(AppError::GatewayUnavailable(
                "circuit breaker is open".to_string(),
            ));
        }

        let request_id = format!("{}-{}", payment.order_ref, uuid::Uuid::new_v4().simple());
        let create_date = format_gateway_time(Utc::now());
        let transaction_date = format_gateway_time(payment.created_at);
        let order_info = format!("Check the bill {}", payment.order_ref);
        let ip_addr = "127.0.0.1";

        // The status-check endpoint signs a pipe-joined field list instead of
        // the sorted query string. Field order is part of the contract.
        let hash_data = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            request_id,
            GATEWAY_VERSION,
            "querydr",
            self.config.merchant_id,
            payment.order_ref,
            transaction_date,
            create_date,
            ip_addr,
            order_info,
        );
        let secure_hash = hmac_sha512_hex(&self.config.secret, &hash_data);

        let body = serde_json::json!({
            "vnp_RequestId": request_id,
            "vnp_Version": GATEWAY_VERSION,
            "vnp_Command": "querydr",
            "vnp_TmnCode": self.config.merchant_id,
            "vnp_TxnRef": payment.order_ref,
            "vnp_OrderInfo": order_info,
            "vnp_TransactionDate": transaction_date,
            "vnp_CreateDate": create_date,
            "vnp_IpAddr": ip_addr,
            "vnp_SecureHash": secure_hash,
        });

        let result = async {
            self.http
                .post(&self.config.query_url)
                .json(&body)
                .send()
                .await?
                .error_for_status()?
                .json::<QueryResponse>()
                .await
        }
        .await;

        match result {
            Ok(resp) => {
                self.breaker.record_success();
                let status = map_query_response(&resp, payment);
                info!(
                    order_ref = %payment.order_ref,
                    ?status,
                    message = resp.message.as_deref().unwrap_or(""),
                    "remote verification completed"
                );
                Ok(status)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(AppError::GatewayUnavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentMethod, PaymentStatus};
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn test_payment(amount: i64) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            amount,
            status: PaymentStatus::Pending,
            order_ref: "order-123".to_string(),
            method: PaymentMethod::Vnpay,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_config(query_url: &str) -> PaymentConfig {
        PaymentConfig {
            merchant_id: "TESTCODE".to_string(),
            secret: "testsecret".to_string(),
            pay_url: "https://gateway.example/pay".to_string(),
            query_url: query_url.to_string(),
            return_url: "https://shop.example/return".to_string(),
            bank_id: "970422".to_string(),
            bank_account_no: "0011001".to_string(),
            bank_account_name: "CINEMA".to_string(),
            request_timeout_secs: 5,
        }
    }

    fn test_client(query_url: &str) -> PaymentGatewayClient {
        PaymentGatewayClient::from_config(
            &test_config(query_url),
            &CircuitBreakerConfig { failure_threshold: 3, open_timeout_secs: 60 },
        )
    }

    #[test]
    fn signature_base_sorts_keys_and_encodes() {
        let base = signature_base(&params(&[
            ("vnp_TxnRef", "abc 123"),
            ("vnp_Amount", "5000"),
            ("vnp_Command", "pay"),
        ]));
        assert_eq!(base, "vnp_Amount=5000&vnp_Command=pay&vnp_TxnRef=abc%20123");
    }

    #[test]
    fn signature_base_skips_empty_values_and_the_hash_field() {
        let base = signature_base(&params(&[
            ("vnp_Amount", "5000"),
            ("vnp_BankCode", ""),
            ("vnp_SecureHash", "deadbeef"),
        ]));
        assert_eq!(base, "vnp_Amount=5000");
    }

    #[test]
    fn valid_signature_verifies_and_one_flipped_character_does_not() {
        let p = params(&[("vnp_Amount", "5000"), ("vnp_TxnRef", "order-1")]);
        let hash = hmac_sha512_hex("secret", &signature_base(&p));
        assert_eq!(hash.len(), 128);
        assert!(verify_signature(&p, &hash, "secret"));

        let mut tampered = hash.clone().into_bytes();
        tampered[0] = if tampered[0] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(!verify_signature(&p, &tampered, "secret"));
    }

    #[test]
    fn tampered_parameter_breaks_the_signature() {
        let p = params(&[("vnp_Amount", "5000"), ("vnp_TxnRef", "order-1")]);
        let hash = hmac_sha512_hex("secret", &signature_base(&p));
        let altered = params(&[("vnp_Amount", "5001"), ("vnp_TxnRef", "order-1")]);
        assert!(!verify_signature(&altered, &hash, "secret"));
    }

    #[test]
    fn query_response_mapping() {
        let payment = test_payment(1500);
        let resp = |code: &str, txn: &str, amount: &str, ttype: &str, status: &str| QueryResponse {
            response_code: Some(code.to_string()),
            txn_ref: Some(txn.to_string()),
            amount: Some(amount.to_string()),
            transaction_type: Some(ttype.to_string()),
            transaction_status: Some(status.to_string()),
            message: None,
        };

        // Happy path: everything matches.
        assert_eq!(
            map_query_response(&resp("00", "order-123", "150000", "01", "00"), &payment),
            RemoteStatus::Success
        );
        // Non-00 response code is ambiguous, retry later.
        assert_eq!(
            map_query_response(&resp("99", "order-123", "150000", "01", "00"), &payment),
            RemoteStatus::Pending
        );
        // Wrong amount is a hard failure.
        assert_eq!(
            map_query_response(&resp("00", "order-123", "150001", "01", "00"), &payment),
            RemoteStatus::Failed
        );
        // Transaction still processing.
        assert_eq!(
            map_query_response(&resp("00", "order-123", "150000", "01", "01"), &payment),
            RemoteStatus::Pending
        );
        // Settled with a failure status.
        assert_eq!(
            map_query_response(&resp("00", "order-123", "150000", "01", "02"), &payment),
            RemoteStatus::Failed
        );
    }

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, 60);
        assert!(breaker.can_execute());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn intent_url_carries_the_signature() {
        let client = test_client("https://gateway.example/query");
        let url = client.create_intent(&test_payment(1500), None, "10.0.0.1").unwrap();
        assert!(url.starts_with("https://gateway.example/pay?"));
        assert!(url.contains("vnp_Amount=150000"));
        assert!(url.contains("vnp_TxnRef=order-123"));
        assert!(url.contains("&vnp_SecureHash="));
    }

    #[test]
    fn zero_amount_intent_is_rejected() {
        let client = test_client("https://gateway.example/query");
        assert!(matches!(
            client.create_intent(&test_payment(0), None, "10.0.0.1"),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn verify_remote_maps_a_confirmed_transaction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "vnp_ResponseCode": "00",
                "vnp_TxnRef": "order-123",
                "vnp_Amount": "150000",
                "vnp_TransactionType": "01",
                "vnp_TransactionStatus": "00",
                "vnp_Message": "Success"
            })))
            .mount(&server)
            .await;

        let client = test_client(&format!("{}/query", server.uri()));
        let status = client.verify_remote(&test_payment(1500)).await.unwrap();
        assert_eq!(status, RemoteStatus::Success);
    }

    #[tokio::test]
    async fn verify_remote_gateway_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = test_client(&format!("{}/query", server.uri()));
        let err = client.verify_remote(&test_payment(1500)).await.unwrap_err();
        assert!(matches!(err, AppError::GatewayUnavailable(_)));
    }
}
