//! Subscription ledger
//!
//! Owns the account-side lifecycle: linking exchange credentials, tracking
//! capital allocated to bots, and creating/tearing down subscriptions.

use crate::domain::entities::subscription::Subscription;
use crate::domain::entities::trade::{Direction, Trade};
use crate::domain::entities::user::{ExchangeCredentials, User};
use crate::domain::errors::{LedgerError, ValidationError};
use crate::domain::repositories::exchange_api::ExchangeConnector;
use crate::domain::repositories::stores::{SubscriptionStore, TradeStore, UserStore};
use crate::domain::services::BalanceLocks;
use std::sync::Arc;
use tracing::{info, warn};

const SETTLEMENT_CURRENCY: &str = "USDT";

pub struct SubscriptionLedger {
    connector: Arc<dyn ExchangeConnector>,
    users: Arc<dyn UserStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    trades: Arc<dyn TradeStore>,
    locks: Arc<BalanceLocks>,
}

impl SubscriptionLedger {
    pub fn new(
        connector: Arc<dyn ExchangeConnector>,
        users: Arc<dyn UserStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        trades: Arc<dyn TradeStore>,
        locks: Arc<BalanceLocks>,
    ) -> Self {
        Self {
            connector,
            users,
            subscriptions,
            trades,
            locks,
        }
    }

    /// Link exchange credentials to a user, creating the user on first
    /// contact. The credentials are probed with a harmless authenticated
    /// call before anything is stored.
    pub async fn connect_exchange(
        &self,
        user_id: &str,
        creds: ExchangeCredentials,
    ) -> Result<(), LedgerError> {
        let api = self.connector.connect(&creds)?;
        if !api.test_connection().await {
            warn!(user_id, exchange = %creds.exchange, "credential probe failed");
            return Err(LedgerError::CredentialsRejected);
        }

        if self.users.get(user_id).await?.is_none() {
            self.users.insert(&User::new(user_id)).await?;
        }
        self.users.set_credentials(user_id, Some(&creds)).await?;
        info!(user_id, exchange = %creds.exchange, "exchange linked");
        Ok(())
    }

    /// Drop a user's credentials. Refused while any subscription is live,
    /// since settling its trades needs the connection.
    pub async fn disconnect_exchange(&self, user_id: &str) -> Result<(), LedgerError> {
        self.users
            .get(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;

        let active: Vec<String> = self
            .subscriptions
            .find_by_user(user_id)
            .await?
            .into_iter()
            .map(|s| s.bot_name)
            .collect();
        if !active.is_empty() {
            return Err(LedgerError::ActiveSubscriptions(active));
        }

        self.users.set_credentials(user_id, None).await?;
        info!(user_id, "exchange unlinked");
        Ok(())
    }

    /// Subscribe a user to a bot, committing `amount` USDT of their free
    /// exchange balance to it.
    pub async fn subscribe(
        &self,
        user_id: &str,
        bot_name: &str,
        amount: f64,
    ) -> Result<Subscription, LedgerError> {
        if bot_name.trim().is_empty() {
            return Err(ValidationError::MissingSymbol.into());
        }
        if !(amount > 0.0) {
            return Err(ValidationError::InvalidAmount(format!(
                "subscription amount must be positive, got {}",
                amount
            ))
            .into());
        }

        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;
        let creds = user
            .credentials
            .as_ref()
            .ok_or_else(|| LedgerError::CredentialsMissing(user_id.to_string()))?;

        if self.subscriptions.find(user_id, bot_name).await?.is_some() {
            return Err(LedgerError::AlreadySubscribed {
                user_id: user_id.to_string(),
                bot_name: bot_name.to_string(),
            });
        }

        let api = self.connector.connect(creds)?;
        let balances = api.fetch_balance().await?;
        let available = balances
            .iter()
            .find(|b| b.currency == SETTLEMENT_CURRENCY)
            .map(|b| b.available)
            .unwrap_or(0.0);
        let free = free_balance(available, user.balance_allocated_to_bots);
        if amount > free {
            return Err(LedgerError::InsufficientBalance {
                requested: amount,
                available: free,
            });
        }

        let sub = Subscription::new(user_id, bot_name, amount);
        self.subscriptions.insert(&sub).await?;
        self.users.adjust_allocated(user_id, amount).await?;
        info!(user_id, bot_name, amount, symbol = %sub.symbol, "subscribed");
        Ok(sub)
    }

    /// Tear a subscription down and release its capital, serialized against
    /// any in-flight settlement on the same (user, bot) pair. Refused while
    /// an open trade remains on the bot's symbol; settling that trade needs
    /// the subscription.
    pub async fn unsubscribe(&self, user_id: &str, bot_name: &str) -> Result<(), LedgerError> {
        let _guard = self.locks.acquire(user_id, bot_name).await;

        let sub = self
            .subscriptions
            .find(user_id, bot_name)
            .await?
            .ok_or_else(|| LedgerError::SubscriptionNotFound {
                user_id: user_id.to_string(),
                bot_name: bot_name.to_string(),
            })?;

        for direction in [Direction::Long, Direction::Short] {
            let open = self.trades.find_open(user_id, &sub.symbol, direction).await?;
            if !open.is_empty() {
                return Err(LedgerError::OpenTradeExists {
                    symbol: sub.symbol.clone(),
                });
            }
        }

        self.subscriptions.delete(user_id, bot_name).await?;
        // adjust_allocated floors at zero, so a release larger than the
        // remaining allocation cannot drive it negative.
        self.users
            .adjust_allocated(user_id, -sub.bot_initial_balance)
            .await?;
        info!(user_id, bot_name, released = sub.bot_initial_balance, "unsubscribed");
        Ok(())
    }

    /// Account snapshot: the user record plus every live subscription.
    pub async fn account_status(
        &self,
        user_id: &str,
    ) -> Result<(User, Vec<Subscription>), LedgerError> {
        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;
        let subs = self.subscriptions.find_by_user(user_id).await?;
        Ok((user, subs))
    }

    /// Open trades across all of a user's subscribed symbols, used by the
    /// status endpoint.
    pub async fn open_trades(&self, user_id: &str) -> Result<Vec<Trade>, LedgerError> {
        let subs = self.subscriptions.find_by_user(user_id).await?;
        let mut open = Vec::new();
        for sub in &subs {
            for direction in [Direction::Long, Direction::Short] {
                open.extend(
                    self.trades
                        .find_open(user_id, &sub.symbol, direction)
                        .await?,
                );
            }
        }
        Ok(open)
    }
}

/// Exchange balance not yet committed to bots.
fn free_balance(available: f64, allocated: f64) -> f64 {
    (available - allocated).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_balance() {
        assert_eq!(free_balance(1000.0, 300.0), 700.0);
        assert_eq!(free_balance(100.0, 100.0), 0.0);
    }

    #[test]
    fn test_free_balance_never_negative() {
        assert_eq!(free_balance(100.0, 250.0), 0.0);
    }
}
