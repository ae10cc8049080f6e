//! SQLite-backed implementations of the store traits.

use crate::domain::entities::subscription::Subscription;
use crate::domain::entities::trade::{Direction, Trade, STATUS_OPEN};
use crate::domain::entities::user::{ExchangeCredentials, User};
use crate::domain::repositories::stores::{
    StoreError, StoreResult, SubscriptionStore, TradeStore, UserStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{SubscriptionRow, TradeRow, UserRow};

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[derive(Clone)]
pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn insert(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, balance_allocated_to_bots, user_current_balance) \
             VALUES (?, ?, ?)",
        )
        .bind(&user.id)
        .bind(user.balance_allocated_to_bots)
        .bind(user.user_current_balance)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get(&self, user_id: &str) -> StoreResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, exchange, api_key, api_secret, passphrase, \
                    balance_allocated_to_bots, user_current_balance \
             FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(UserRow::into_user))
    }

    async fn set_credentials(
        &self,
        user_id: &str,
        creds: Option<&ExchangeCredentials>,
    ) -> StoreResult<()> {
        let result = match creds {
            Some(creds) => sqlx::query(
                "UPDATE users SET exchange = ?, api_key = ?, api_secret = ?, passphrase = ? \
                 WHERE id = ?",
            )
            .bind(&creds.exchange)
            .bind(&creds.api_key)
            .bind(creds.api_secret.as_str())
            .bind(creds.passphrase.as_ref().map(|p| p.as_str()))
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?,
            None => sqlx::query(
                "UPDATE users SET exchange = NULL, api_key = NULL, api_secret = NULL, \
                 passphrase = NULL WHERE id = ?",
            )
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?,
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn adjust_allocated(&self, user_id: &str, delta: f64) -> StoreResult<f64> {
        sqlx::query_scalar(
            "UPDATE users SET balance_allocated_to_bots = MAX(0, balance_allocated_to_bots + ?) \
             WHERE id = ? RETURNING balance_allocated_to_bots",
        )
        .bind(delta)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))
    }

    async fn adjust_current_balance(&self, user_id: &str, delta: f64) -> StoreResult<f64> {
        sqlx::query_scalar(
            "UPDATE users SET user_current_balance = user_current_balance + ? \
             WHERE id = ? RETURNING user_current_balance",
        )
        .bind(delta)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))
    }
}

#[derive(Clone)]
pub struct SqliteSubscriptionStore {
    pool: SqlitePool,
}

impl SqliteSubscriptionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const SUBSCRIPTION_COLUMNS: &str =
    "user_id, bot_name, symbol, bot_initial_balance, bot_current_balance";

#[async_trait]
impl SubscriptionStore for SqliteSubscriptionStore {
    async fn insert(&self, sub: &Subscription) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO subscriptions \
             (user_id, bot_name, symbol, bot_initial_balance, bot_current_balance) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&sub.user_id)
        .bind(&sub.bot_name)
        .bind(&sub.symbol)
        .bind(sub.bot_initial_balance)
        .bind(sub.bot_current_balance)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn find(&self, user_id: &str, bot_name: &str) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = ? AND bot_name = ?",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .bind(bot_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(SubscriptionRow::into_subscription))
    }

    async fn find_by_user(&self, user_id: &str) -> StoreResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = ? ORDER BY bot_name",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(SubscriptionRow::into_subscription).collect())
    }

    async fn find_by_symbol(&self, symbol: &str) -> StoreResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE symbol = ? ORDER BY user_id",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(SubscriptionRow::into_subscription).collect())
    }

    async fn delete(&self, user_id: &str, bot_name: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE user_id = ? AND bot_name = ?")
            .bind(user_id)
            .bind(bot_name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "subscription {}/{}",
                user_id, bot_name
            )));
        }
        Ok(())
    }

    async fn adjust_bot_balance(
        &self,
        user_id: &str,
        bot_name: &str,
        delta: f64,
    ) -> StoreResult<f64> {
        sqlx::query_scalar(
            "UPDATE subscriptions SET bot_current_balance = MAX(0, bot_current_balance + ?) \
             WHERE user_id = ? AND bot_name = ? RETURNING bot_current_balance",
        )
        .bind(delta)
        .bind(user_id)
        .bind(bot_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(format!("subscription {}/{}", user_id, bot_name)))
    }
}

#[derive(Clone)]
pub struct SqliteTradeStore {
    pool: SqlitePool,
}

impl SqliteTradeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const TRADE_COLUMNS: &str = "id, user_id, order_id, symbol, direction, entry_time, entry_price, \
                             stop_loss, take_profit, leverage, initial_margin, status, pnl, exit_time";

#[async_trait]
impl TradeStore for SqliteTradeStore {
    async fn insert(&self, trade: &Trade) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO trades ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TRADE_COLUMNS
        ))
        .bind(&trade.id)
        .bind(&trade.user_id)
        .bind(&trade.order_id)
        .bind(&trade.symbol)
        .bind(trade.direction.as_str())
        .bind(trade.entry_time)
        .bind(trade.entry_price)
        .bind(trade.stop_loss)
        .bind(trade.take_profit)
        .bind(trade.leverage)
        .bind(trade.initial_margin)
        .bind(&trade.status)
        .bind(trade.pnl)
        .bind(trade.exit_time)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn find_open(
        &self,
        user_id: &str,
        symbol: &str,
        direction: Direction,
    ) -> StoreResult<Vec<Trade>> {
        let rows: Vec<TradeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM trades \
             WHERE user_id = ? AND symbol = ? AND direction = ? AND status = ? \
             ORDER BY entry_time DESC",
            TRADE_COLUMNS
        ))
        .bind(user_id)
        .bind(symbol)
        .bind(direction.as_str())
        .bind(STATUS_OPEN)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(TradeRow::into_trade).collect()
    }

    async fn close(
        &self,
        trade_id: &str,
        reason: &str,
        exit_time: DateTime<Utc>,
        pnl: Option<f64>,
    ) -> StoreResult<bool> {
        // Guarded on OPEN so a concurrent or repeated settlement flips the
        // row at most once.
        let result = sqlx::query(
            "UPDATE trades SET status = ?, exit_time = ?, pnl = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(reason)
        .bind(exit_time)
        .bind(pnl)
        .bind(trade_id)
        .bind(STATUS_OPEN)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}
