//! Environment-driven configuration.
//!
//! Every knob has a safe default; a malformed value logs a warning and
//! falls back rather than aborting startup.

use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub bybit_base_url: String,
    pub okx_base_url: String,
    /// Send OKX the demo-trading header.
    pub okx_simulated: bool,
    pub recv_window: String,
    pub request_timeout: Duration,
    /// Orders below this USDT value are rejected before reaching the
    /// exchange.
    pub min_notional_usdt: f64,
    /// Leverage sent to the exchange instead of the instrument maximum.
    pub leverage_override: Option<f64>,
    pub max_concurrent_subscribers: usize,
    pub settlement_poll_attempts: u32,
    pub settlement_poll_base_delay: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("SERVER_ADDR", "0.0.0.0:3000"),
            database_url: env_or("DATABASE_URL", "sqlite://mirrorbot.db"),
            bybit_base_url: env_or("BYBIT_BASE_URL", "https://api-demo.bybit.com"),
            okx_base_url: env_or("OKX_BASE_URL", "https://www.okx.com"),
            okx_simulated: parse_env("OKX_SIMULATED_TRADING", true),
            recv_window: env_or("BYBIT_RECV_WINDOW", "5000"),
            request_timeout: Duration::from_secs(parse_env("HTTP_TIMEOUT_SECS", 10u64)),
            min_notional_usdt: parse_env("MIN_NOTIONAL_USDT", 20.0),
            leverage_override: parse_env_opt("LEVERAGE_OVERRIDE"),
            max_concurrent_subscribers: parse_env("MAX_CONCURRENT_SUBSCRIBERS", 8usize),
            settlement_poll_attempts: parse_env("SETTLEMENT_POLL_ATTEMPTS", 5u32),
            settlement_poll_base_delay: Duration::from_millis(parse_env(
                "SETTLEMENT_POLL_BASE_DELAY_MS",
                500u64,
            )),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, raw, %default, "unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_opt<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, raw, "unparseable value, ignoring");
            None
        }
    }
}
