//! Row types mapped by sqlx, converted at the edge into domain entities.

use crate::domain::entities::subscription::Subscription;
use crate::domain::entities::trade::{Direction, Trade};
use crate::domain::entities::user::{ExchangeCredentials, User};
use crate::domain::repositories::stores::StoreError;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, FromRow)]
pub struct UserRow {
    pub id: String,
    pub exchange: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub passphrase: Option<String>,
    pub balance_allocated_to_bots: f64,
    pub user_current_balance: f64,
}

impl UserRow {
    pub fn into_user(self) -> User {
        let credentials = match (self.exchange, self.api_key, self.api_secret) {
            (Some(exchange), Some(api_key), Some(api_secret)) => Some(ExchangeCredentials::new(
                &exchange,
                &api_key,
                &api_secret,
                self.passphrase.as_deref(),
            )),
            _ => None,
        };
        User {
            id: self.id,
            credentials,
            balance_allocated_to_bots: self.balance_allocated_to_bots,
            user_current_balance: self.user_current_balance,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct SubscriptionRow {
    pub user_id: String,
    pub bot_name: String,
    pub symbol: String,
    pub bot_initial_balance: f64,
    pub bot_current_balance: f64,
}

impl SubscriptionRow {
    pub fn into_subscription(self) -> Subscription {
        Subscription {
            user_id: self.user_id,
            bot_name: self.bot_name,
            symbol: self.symbol,
            bot_initial_balance: self.bot_initial_balance,
            bot_current_balance: self.bot_current_balance,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct TradeRow {
    pub id: String,
    pub user_id: String,
    pub order_id: Option<String>,
    pub symbol: String,
    pub direction: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub leverage: f64,
    pub initial_margin: f64,
    pub status: String,
    pub pnl: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
}

impl TradeRow {
    pub fn into_trade(self) -> Result<Trade, StoreError> {
        let direction = Direction::parse(&self.direction)
            .map_err(|e| StoreError::Backend(format!("corrupt trade row {}: {}", self.id, e)))?;
        Ok(Trade {
            id: self.id,
            user_id: self.user_id,
            order_id: self.order_id,
            symbol: self.symbol,
            direction,
            entry_time: self.entry_time,
            entry_price: self.entry_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            leverage: self.leverage,
            initial_margin: self.initial_margin,
            status: self.status,
            pnl: self.pnl,
            exit_time: self.exit_time,
        })
    }
}
