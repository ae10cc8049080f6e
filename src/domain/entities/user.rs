//! Users and their exchange credential sets.

use zeroize::Zeroizing;

/// API credential set for a linked exchange account.
///
/// Secrets are zeroized on drop and redacted from Debug output.
#[derive(Clone)]
pub struct ExchangeCredentials {
    pub exchange: String,
    pub api_key: String,
    pub api_secret: Zeroizing<String>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl ExchangeCredentials {
    pub fn new(
        exchange: &str,
        api_key: &str,
        api_secret: &str,
        passphrase: Option<&str>,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            api_key: api_key.to_string(),
            api_secret: Zeroizing::new(api_secret.to_string()),
            passphrase: passphrase.map(|p| Zeroizing::new(p.to_string())),
        }
    }
}

impl std::fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("exchange", &self.exchange)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<REDACTED>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

/// A platform user.
///
/// The canonical balance schema is exactly these two fields:
/// `balance_allocated_to_bots` is capital committed across subscriptions
/// (never negative), `user_current_balance` is net realized PnL (may go
/// negative).
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub credentials: Option<ExchangeCredentials>,
    pub balance_allocated_to_bots: f64,
    pub user_current_balance: f64,
}

impl User {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            credentials: None,
            balance_allocated_to_bots: 0.0,
            user_current_balance: 0.0,
        }
    }
}
