//! Settlement reconciler
//!
//! Closes the open trade that matches a close signal, reconciles the realized
//! PnL against the exchange's closed-PnL history, and applies the matched PnL
//! to the subscription and user balances exactly once.

use crate::domain::entities::signal::{CloseSignal, PnlMatch, SettlementOutcome, SettlementReport};
use crate::domain::entities::subscription::Subscription;
use crate::domain::entities::trade::{normalize_symbol, Direction};
use crate::domain::errors::{SettlementError, ValidationError};
use crate::domain::repositories::exchange_api::{
    ClosedPnlRecord, ExchangeApi, ExchangeConnector, MarketOrderRequest,
};
use crate::domain::repositories::stores::{SubscriptionStore, TradeStore, UserStore};
use crate::domain::services::BalanceLocks;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Closed-PnL polling attempts before giving up on a match.
    pub poll_attempts: u32,
    /// Delay before the second attempt; doubled on every subsequent one.
    pub poll_base_delay: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 5,
            poll_base_delay: Duration::from_millis(500),
        }
    }
}

pub struct SettlementReconciler {
    connector: Arc<dyn ExchangeConnector>,
    users: Arc<dyn UserStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    trades: Arc<dyn TradeStore>,
    locks: Arc<BalanceLocks>,
    config: SettlementConfig,
}

impl SettlementReconciler {
    pub fn new(
        connector: Arc<dyn ExchangeConnector>,
        users: Arc<dyn UserStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        trades: Arc<dyn TradeStore>,
        locks: Arc<BalanceLocks>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            connector,
            users,
            subscriptions,
            trades,
            locks,
            config,
        }
    }

    /// Close and settle the most recent open trade matching the signal.
    ///
    /// Safe to retry: once the trade record has been flipped out of OPEN, a
    /// repeated signal reports `AlreadyClosed` and touches no balance.
    pub async fn close_trade(
        &self,
        signal: &CloseSignal,
    ) -> Result<SettlementReport, SettlementError> {
        let direction = Direction::parse(&signal.direction)?;
        let symbol = normalize_symbol(&signal.symbol);
        if symbol.is_empty() {
            return Err(ValidationError::MissingSymbol.into());
        }

        let sub = self
            .subscriptions
            .find_by_symbol(&symbol)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SettlementError::SubscriptionNotFound(symbol.clone()))?;
        let user = self
            .users
            .get(&sub.user_id)
            .await?
            .ok_or_else(|| SettlementError::UserNotFound(sub.user_id.clone()))?;
        let creds = user
            .credentials
            .as_ref()
            .ok_or_else(|| SettlementError::CredentialsMissing(sub.user_id.clone()))?;
        let api = self.connector.connect(creds)?;

        // Most recent open trade wins when duplicates slipped through.
        let trade = self
            .trades
            .find_open(&sub.user_id, &symbol, direction)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SettlementError::OpenTradeNotFound {
                symbol: symbol.clone(),
                direction: direction.to_string(),
            })?;

        self.flatten_position(api.as_ref(), &symbol, direction).await;

        let pnl_match = self.poll_closed_pnl(api.as_ref(), &symbol, trade.entry_price).await;
        let exit_time = Utc::now();
        let pnl = match pnl_match {
            PnlMatch::Matched(pnl) => Some(pnl),
            PnlMatch::NoMatch => None,
        };

        let flipped = self
            .trades
            .close(&trade.id, &signal.reason, exit_time, pnl)
            .await?;
        if !flipped {
            info!(trade_id = %trade.id, symbol = %symbol, "trade already settled");
            return Ok(SettlementReport {
                symbol,
                direction,
                trade_id: trade.id,
                outcome: SettlementOutcome::AlreadyClosed,
            });
        }

        let outcome = match pnl {
            Some(pnl) => {
                let balances_updated = self.apply_pnl(&sub, pnl).await;
                info!(
                    trade_id = %trade.id,
                    symbol = %symbol,
                    pnl,
                    balances_updated,
                    "trade settled"
                );
                SettlementOutcome::Settled {
                    exit_time,
                    pnl,
                    balances_updated,
                }
            }
            None => {
                warn!(
                    trade_id = %trade.id,
                    symbol = %symbol,
                    entry_price = trade.entry_price,
                    "trade closed without a matching PnL record"
                );
                SettlementOutcome::ClosedNoMatch { exit_time }
            }
        };

        Ok(SettlementReport {
            symbol,
            direction,
            trade_id: trade.id,
            outcome,
        })
    }

    /// Send a reduce-only market order if a live position remains. A stop or
    /// take-profit fill may already have flattened it on the exchange side,
    /// so failure here is logged and settlement continues.
    async fn flatten_position(&self, api: &dyn ExchangeApi, symbol: &str, direction: Direction) {
        let position = match api.position_info(symbol).await {
            Ok(position) => position,
            Err(e) => {
                debug!(symbol, error = %e, "no live position to flatten");
                return;
            }
        };
        if position.direction != direction || position.size.parse::<f64>().unwrap_or(0.0) <= 0.0 {
            return;
        }
        let order = MarketOrderRequest {
            symbol: symbol.to_string(),
            direction: direction.opposite(),
            qty: position.size.clone(),
            position_idx: 0,
            reduce_only: true,
            stop_loss: None,
            take_profit: None,
        };
        match api.place_market_order(&order).await {
            Ok(order_id) => info!(symbol, order_id = %order_id, "closing order placed"),
            Err(e) => warn!(symbol, error = %e, "closing order failed, reconciling anyway"),
        }
    }

    /// Poll the closed-PnL history with exponential backoff until a record
    /// matches the trade's entry price or the attempts run out.
    async fn poll_closed_pnl(
        &self,
        api: &dyn ExchangeApi,
        symbol: &str,
        entry_price: f64,
    ) -> PnlMatch {
        let attempts = self.config.poll_attempts.max(1);
        for attempt in 0..attempts {
            match api.closed_pnl(symbol).await {
                Ok(records) => {
                    if let PnlMatch::Matched(pnl) = match_pnl(&records, entry_price) {
                        return PnlMatch::Matched(pnl);
                    }
                    debug!(symbol, attempt, "no PnL record matched yet");
                }
                Err(e) => warn!(symbol, attempt, error = %e, "closed-PnL query failed"),
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.poll_base_delay * 2u32.pow(attempt)).await;
            }
        }
        PnlMatch::NoMatch
    }

    /// Apply the matched PnL to the bot and user balances, serialized per
    /// (user, bot) pair. Returns false when any store write failed.
    async fn apply_pnl(&self, sub: &Subscription, pnl: f64) -> bool {
        let _guard = self.locks.acquire(&sub.user_id, &sub.bot_name).await;

        let mut updated = true;
        match self
            .subscriptions
            .adjust_bot_balance(&sub.user_id, &sub.bot_name, pnl)
            .await
        {
            Ok(balance) => debug!(user_id = %sub.user_id, bot = %sub.bot_name, balance, "bot balance adjusted"),
            Err(e) => {
                warn!(user_id = %sub.user_id, bot = %sub.bot_name, error = %e, "bot balance update failed");
                updated = false;
            }
        }
        if let Err(e) = self.users.adjust_current_balance(&sub.user_id, pnl).await {
            warn!(user_id = %sub.user_id, error = %e, "user balance update failed");
            updated = false;
        }
        updated
    }
}

/// Exchange-reported entry prices drift in the low decimals, so records are
/// matched on price truncated (not rounded) to one decimal. Ties resolve to
/// the first record in exchange-returned order.
fn match_pnl(records: &[ClosedPnlRecord], entry_price: f64) -> PnlMatch {
    let wanted = truncate_one_decimal(entry_price);
    for record in records {
        if truncate_one_decimal(record.avg_entry_price) == wanted {
            return PnlMatch::Matched(record.closed_pnl);
        }
    }
    PnlMatch::NoMatch
}

fn truncate_one_decimal(value: f64) -> f64 {
    (value * 10.0).trunc() / 10.0
}
