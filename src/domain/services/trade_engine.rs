//! Trade fan-out engine
//!
//! Receives one open signal and executes it once per subscriber, each on the
//! subscriber's own exchange connection. A failure for one subscriber never
//! interrupts the others; every subscriber is accounted for in the report.

use crate::domain::entities::signal::{FanOutReport, OpenSignal, SubscriberOutcome, SubscriberResult};
use crate::domain::entities::subscription::Subscription;
use crate::domain::entities::trade::{normalize_symbol, Direction, Trade, STATUS_OPEN};
use crate::domain::errors::{EngineError, ValidationError};
use crate::domain::repositories::exchange_api::{ExchangeApi, ExchangeConnector, MarketOrderRequest};
use crate::domain::repositories::stores::{SubscriptionStore, TradeStore, UserStore};
use crate::domain::services::position_sizer::{PositionSizer, SizingOutcome, SizingRequest};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Bybit one-way position mode.
const POSITION_IDX_ONE_WAY: i32 = 0;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on subscribers executed concurrently per signal.
    pub max_concurrent_subscribers: usize,
    /// Leverage sent to the exchange instead of the instrument maximum.
    /// Always clamped to the instrument maximum.
    pub leverage_override: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subscribers: 8,
            leverage_override: None,
        }
    }
}

pub struct TradeEngine {
    connector: Arc<dyn ExchangeConnector>,
    users: Arc<dyn UserStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    trades: Arc<dyn TradeStore>,
    sizer: PositionSizer,
    config: EngineConfig,
}

impl TradeEngine {
    pub fn new(
        connector: Arc<dyn ExchangeConnector>,
        users: Arc<dyn UserStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        trades: Arc<dyn TradeStore>,
        sizer: PositionSizer,
        config: EngineConfig,
    ) -> Self {
        Self {
            connector,
            users,
            subscriptions,
            trades,
            sizer,
            config,
        }
    }

    /// Open a position for every subscriber of the signal's symbol.
    ///
    /// Validation failures reject the whole signal before any order is
    /// placed. Past that point each subscriber succeeds or fails on its own.
    pub async fn open_trade(&self, signal: &OpenSignal) -> Result<FanOutReport, EngineError> {
        let direction = Direction::parse(&signal.direction)?;
        let symbol = normalize_symbol(&signal.symbol);
        if symbol.is_empty() {
            return Err(ValidationError::MissingSymbol.into());
        }
        if !(signal.investment_per_trade > 0.0) {
            return Err(ValidationError::InvalidAmount(format!(
                "investment_per_trade must be positive, got {}",
                signal.investment_per_trade
            ))
            .into());
        }
        if !(signal.amount_multiplier > 0.0) {
            return Err(ValidationError::InvalidAmount(format!(
                "amount_multiplier must be positive, got {}",
                signal.amount_multiplier
            ))
            .into());
        }

        let subscribers = self.subscriptions.find_by_symbol(&symbol).await?;
        info!(
            symbol = %symbol,
            direction = %direction,
            subscribers = subscribers.len(),
            "fanning out open signal"
        );

        let symbol_ref: &str = &symbol;
        let outcomes: Vec<SubscriberOutcome> = stream::iter(subscribers.into_iter())
            .map(|sub| async move {
                self.open_for_subscriber(&sub, symbol_ref, direction, signal)
                    .await
            })
            .buffer_unordered(self.config.max_concurrent_subscribers.max(1))
            .collect()
            .await;

        Ok(FanOutReport {
            processed: outcomes.len(),
            outcomes,
        })
    }

    async fn open_for_subscriber(
        &self,
        sub: &Subscription,
        symbol: &str,
        direction: Direction,
        signal: &OpenSignal,
    ) -> SubscriberOutcome {
        let result = match self.try_open(sub, symbol, direction, signal).await {
            Ok(result) => {
                if let SubscriberResult::Success { ref order_id, .. } = result {
                    info!(user_id = %sub.user_id, symbol, order_id = %order_id, "position opened");
                }
                result
            }
            Err(reason) => {
                warn!(user_id = %sub.user_id, symbol, %reason, "subscriber skipped");
                SubscriberResult::Failed { reason }
            }
        };
        SubscriberOutcome {
            user_id: sub.user_id.clone(),
            result,
        }
    }

    async fn try_open(
        &self,
        sub: &Subscription,
        symbol: &str,
        direction: Direction,
        signal: &OpenSignal,
    ) -> Result<SubscriberResult, String> {
        let user = self
            .users
            .get(&sub.user_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("user {} not found", sub.user_id))?;
        let creds = user
            .credentials
            .as_ref()
            .ok_or_else(|| "no exchange connection linked".to_string())?;
        let api = self.connector.connect(creds).map_err(|e| e.to_string())?;

        let already_open = self
            .trades
            .find_open(&sub.user_id, symbol, direction)
            .await
            .map_err(|e| e.to_string())?;
        if !already_open.is_empty() {
            return Err(format!("a {} position on {} is already open", direction, symbol));
        }

        let instrument = api
            .instrument_info(symbol)
            .await
            .map_err(|e| format!("instrument lookup failed: {}", e))?;
        let price = api
            .last_price(symbol)
            .await
            .map_err(|e| format!("price lookup failed: {}", e))?;

        let sizing = SizingRequest {
            capital: sub.bot_initial_balance,
            percentage: signal.investment_per_trade,
            multiplier: signal.amount_multiplier,
            price,
        };
        let qty = match self.sizer.size(&sizing, &instrument) {
            Ok(SizingOutcome::Order { qty, .. }) => qty,
            Ok(SizingOutcome::BelowMinNotional { notional }) => {
                return Err(format!(
                    "order value {:.2} USDT is below the minimum notional",
                    notional
                ));
            }
            Err(e) => return Err(e.to_string()),
        };

        let leverage = self
            .config
            .leverage_override
            .unwrap_or(instrument.max_leverage)
            .min(instrument.max_leverage);
        api.set_leverage(symbol, &format_leverage(leverage))
            .await
            .map_err(|e| format!("leverage update failed: {}", e))?;

        let order = MarketOrderRequest {
            symbol: symbol.to_string(),
            direction,
            qty: qty.clone(),
            position_idx: POSITION_IDX_ONE_WAY,
            reduce_only: false,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
        };
        let order_id = api
            .place_market_order(&order)
            .await
            .map_err(|e| format!("order rejected: {}", e))?;

        // The order went through; from here on failures must name it so the
        // position is traceable even without a trade record.
        let trade = self
            .record_trade(api.as_ref(), sub, symbol, direction, &order_id)
            .await
            .map_err(|e| format!("order {} placed but not recorded: {}", order_id, e))?;

        Ok(SubscriberResult::Success {
            order_id,
            qty,
            entry_price: trade.entry_price,
        })
    }

    /// Read back the confirmed position and persist the trade record with
    /// exchange-authoritative fill data.
    async fn record_trade(
        &self,
        api: &dyn ExchangeApi,
        sub: &Subscription,
        symbol: &str,
        direction: Direction,
        order_id: &str,
    ) -> Result<Trade, String> {
        let position = api
            .position_info(symbol)
            .await
            .map_err(|e| format!("position lookup failed: {}", e))?;

        let entry_time = DateTime::<Utc>::from_timestamp_millis(position.created_time_ms)
            .unwrap_or_else(Utc::now);
        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            user_id: sub.user_id.clone(),
            order_id: Some(order_id.to_string()),
            symbol: symbol.to_string(),
            direction,
            entry_time,
            entry_price: position.avg_price,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            leverage: position.leverage,
            initial_margin: position.initial_margin,
            status: STATUS_OPEN.to_string(),
            pnl: None,
            exit_time: None,
        };
        self.trades
            .insert(&trade)
            .await
            .map_err(|e| e.to_string())?;
        Ok(trade)
    }
}

/// Leverage as the exchange expects it: "50" rather than "50.0".
fn format_leverage(leverage: f64) -> String {
    if leverage.fract() == 0.0 {
        format!("{}", leverage as i64)
    } else {
        leverage.to_string()
    }
}
