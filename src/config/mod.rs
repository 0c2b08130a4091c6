use std::env;

// Top-level configuration container, populated from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub payment: PaymentConfig,
    pub reconciler: ReconcilerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub rust_log: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

// Gateway credentials and endpoints. `merchant_id` and `secret` are the
// shared values every signature is computed against.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub merchant_id: String,
    pub secret: String,
    pub pay_url: String,
    pub query_url: String,
    pub return_url: String,
    pub bank_id: String,
    pub bank_account_no: String,
    pub bank_account_name: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub sweep_interval_secs: u64,
    pub pending_timeout_secs: i64,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            app: AppConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8000".to_string())
                    .parse()
                    .expect("PORT must be a valid number"),
                rust_log: env::var("RUST_LOG")
                    .unwrap_or_else(|_| "cinema_booking=debug,tower_http=debug".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
                pool_size: env::var("DB_POOL_SIZE")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()
                    .expect("DB_POOL_SIZE must be a valid number"),
            },
            payment: PaymentConfig {
                merchant_id: env::var("MERCHANT_ID").expect("MERCHANT_ID must be set"),
                secret: env::var("MERCHANT_SECRET").expect("MERCHANT_SECRET must be set"),
                pay_url: env::var("GATEWAY_PAY_URL").unwrap_or_else(|_| {
                    "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string()
                }),
                query_url: env::var("GATEWAY_QUERY_URL").unwrap_or_else(|_| {
                    "https://sandbox.vnpayment.vn/merchant_webapi/api/transaction".to_string()
                }),
                return_url: env::var("PAYMENT_RETURN_URL").unwrap_or_else(|_| {
                    "https://localhost:8080/api/payment/order-complete".to_string()
                }),
                bank_id: env::var("QR_BANK_ID").unwrap_or_else(|_| "970422".to_string()),
                bank_account_no: env::var("QR_ACCOUNT_NO").unwrap_or_default(),
                bank_account_name: env::var("QR_ACCOUNT_NAME").unwrap_or_default(),
                request_timeout_secs: env::var("GATEWAY_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .expect("GATEWAY_TIMEOUT_SECONDS must be a valid number"),
            },
            reconciler: ReconcilerConfig {
                sweep_interval_secs: env::var("RECONCILER_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .expect("RECONCILER_INTERVAL_SECONDS must be a valid number"),
                pending_timeout_secs: env::var("BOOKING_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .expect("BOOKING_TIMEOUT_SECONDS must be a valid number"),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env::var("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .expect("CIRCUIT_BREAKER_FAILURE_THRESHOLD must be a valid number"),
                open_timeout_secs: env::var("CIRCUIT_BREAKER_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .expect("CIRCUIT_BREAKER_TIMEOUT_SECONDS must be a valid number"),
            },
        }
    }
}
