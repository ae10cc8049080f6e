//! Collaborator store traits
//!
//! The core consumes the user/subscription/trade stores abstractly: a
//! document store keyed by user and by symbol. The sqlx repositories in
//! `persistence` implement these traits; tests substitute in-memory mocks.

use crate::domain::entities::subscription::Subscription;
use crate::domain::entities::trade::{Direction, Trade};
use crate::domain::entities::user::{ExchangeCredentials, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for crate::domain::errors::LedgerError {
    fn from(err: StoreError) -> Self {
        crate::domain::errors::LedgerError::Store(err.to_string())
    }
}

impl From<StoreError> for crate::domain::errors::EngineError {
    fn from(err: StoreError) -> Self {
        crate::domain::errors::EngineError::Store(err.to_string())
    }
}

impl From<StoreError> for crate::domain::errors::SettlementError {
    fn from(err: StoreError) -> Self {
        crate::domain::errors::SettlementError::Store(err.to_string())
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert(&self, user: &User) -> StoreResult<()>;

    async fn get(&self, user_id: &str) -> StoreResult<Option<User>>;

    /// Replace the user's exchange credential set (None disconnects).
    async fn set_credentials(
        &self,
        user_id: &str,
        creds: Option<&ExchangeCredentials>,
    ) -> StoreResult<()>;

    /// Adjust `balance_allocated_to_bots` by `delta`, floored at zero.
    async fn adjust_allocated(&self, user_id: &str, delta: f64) -> StoreResult<f64>;

    /// Adjust `user_current_balance` by `delta`. No floor.
    async fn adjust_current_balance(&self, user_id: &str, delta: f64) -> StoreResult<f64>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert(&self, sub: &Subscription) -> StoreResult<()>;

    async fn find(&self, user_id: &str, bot_name: &str) -> StoreResult<Option<Subscription>>;

    async fn find_by_user(&self, user_id: &str) -> StoreResult<Vec<Subscription>>;

    async fn find_by_symbol(&self, symbol: &str) -> StoreResult<Vec<Subscription>>;

    async fn delete(&self, user_id: &str, bot_name: &str) -> StoreResult<()>;

    /// Adjust `bot_current_balance` by `delta`, floored at zero. Returns the
    /// new balance.
    async fn adjust_bot_balance(
        &self,
        user_id: &str,
        bot_name: &str,
        delta: f64,
    ) -> StoreResult<f64>;
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn insert(&self, trade: &Trade) -> StoreResult<()>;

    /// Open trades for (user, symbol, direction), most recent entry first.
    async fn find_open(
        &self,
        user_id: &str,
        symbol: &str,
        direction: Direction,
    ) -> StoreResult<Vec<Trade>>;

    /// Close a trade, guarded on it still being OPEN. Returns false when the
    /// trade was already closed, which makes settlement retries no-ops.
    async fn close(
        &self,
        trade_id: &str,
        reason: &str,
        exit_time: DateTime<Utc>,
        pnl: Option<f64>,
    ) -> StoreResult<bool>;
}
