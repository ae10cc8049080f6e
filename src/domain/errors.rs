use thiserror::Error;

/// Errors raised while talking to an exchange REST API.
///
/// All of these are non-fatal: callers convert them into per-subscriber
/// failure reasons or settlement no-match outcomes, never into a panic.
#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("exchange rejected request (code {code}): {message}")]
    ApiRejection { code: i64, message: String },

    #[error("request signing failed: {0}")]
    Signing(String),

    #[error("empty result from exchange: {0}")]
    MissingData(String),

    #[error("operation not supported by {exchange}: {operation}")]
    Unsupported {
        exchange: String,
        operation: String,
    },
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Input validation errors, rejected before any side effect.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("direction must be 'long' or 'short', got '{0}'")]
    InvalidDirection(String),

    #[error("missing symbol")]
    MissingSymbol,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

/// Subscription ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("user {0} has no exchange credentials linked")]
    CredentialsMissing(String),

    #[error("exchange rejected the provided credentials")]
    CredentialsRejected,

    #[error("subscription already exists for user {user_id} and bot {bot_name}")]
    AlreadySubscribed { user_id: String, bot_name: String },

    #[error("subscription not found for user {user_id} and bot {bot_name}")]
    SubscriptionNotFound { user_id: String, bot_name: String },

    #[error("insufficient free balance: requested {requested:.2}, available {available:.2}")]
    InsufficientBalance { requested: f64, available: f64 },

    #[error("unsubscribe active bots first: {0:?}")]
    ActiveSubscriptions(Vec<String>),

    #[error("an open trade exists for {symbol}; close it before unsubscribing")]
    OpenTradeExists { symbol: String },

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("store error: {0}")]
    Store(String),
}

/// Fan-out engine errors. Per-subscriber failures never surface here; they
/// become `Failed` outcomes in the report. These cover only signal
/// validation and the subscriber-list lookup itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("store error: {0}")]
    Store(String),
}

/// Settlement reconciliation errors.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("no subscription found for symbol {0}")]
    SubscriptionNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("no open {direction} trade found for {symbol}")]
    OpenTradeNotFound { symbol: String, direction: String },

    #[error("user {0} has no exchange credentials linked")]
    CredentialsMissing(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("store error: {0}")]
    Store(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_error_display() {
        let err = ExchangeError::ApiRejection {
            code: 10004,
            message: "invalid sign".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "exchange rejected request (code 10004): invalid sign"
        );
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::InvalidDirection("sideways".to_string());
        assert!(err.to_string().contains("sideways"));
    }

    #[test]
    fn test_ledger_error_from_validation() {
        let err: LedgerError = ValidationError::MissingSymbol.into();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
