//! Exchange API trait
//!
//! Common interface over the derivatives exchange REST integrations. The
//! trade engine, settlement reconciler and subscription ledger only ever see
//! this trait, which keeps them exchange-agnostic and easy to mock in tests.

use crate::domain::entities::trade::Direction;
use crate::domain::entities::user::ExchangeCredentials;
use crate::domain::errors::{ExchangeError, ExchangeResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Lot-size and leverage constraints for an instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentInfo {
    pub qty_step: f64,
    pub min_order_qty: f64,
    pub max_leverage: f64,
}

/// Authoritative fill data for a live position.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub direction: Direction,
    /// Position size in base units, as reported by the exchange.
    pub size: String,
    pub avg_price: f64,
    pub created_time_ms: i64,
    pub leverage: f64,
    pub initial_margin: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// One realized-PnL record from the exchange's closed-PnL history.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPnlRecord {
    pub symbol: String,
    pub side: String,
    pub avg_entry_price: f64,
    pub closed_pnl: f64,
}

#[derive(Debug, Clone)]
pub struct AccountBalance {
    pub currency: String,
    pub available: f64,
    pub total: f64,
}

/// A market order with optional attached stop-loss/take-profit.
#[derive(Debug, Clone)]
pub struct MarketOrderRequest {
    pub symbol: String,
    pub direction: Direction,
    /// Already formatted to the instrument's step precision.
    pub qty: String,
    pub position_idx: i32,
    /// Set on closing orders so a fill can only reduce the position.
    pub reduce_only: bool,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Capability set shared by both exchange integrations.
///
/// The Bybit client serves the full set; the OKX client serves the
/// account-level subset ({test connection, fetch balance, place/close order})
/// and reports `Unsupported` for the derivatives metadata operations it does
/// not expose.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    fn name(&self) -> &str;

    /// Probe the credentials with a harmless authenticated call.
    async fn test_connection(&self) -> bool;

    async fn fetch_balance(&self) -> ExchangeResult<Vec<AccountBalance>>;

    /// Exchange server time in milliseconds since epoch.
    async fn server_time_ms(&self) -> ExchangeResult<i64>;

    async fn instrument_info(&self, symbol: &str) -> ExchangeResult<InstrumentInfo>;

    async fn last_price(&self, symbol: &str) -> ExchangeResult<f64>;

    /// Set buy and sell leverage for the symbol.
    async fn set_leverage(&self, symbol: &str, leverage: &str) -> ExchangeResult<()>;

    /// Place a market order, returning the exchange order id.
    async fn place_market_order(&self, order: &MarketOrderRequest) -> ExchangeResult<String>;

    /// Live position for the symbol, if any.
    async fn position_info(&self, symbol: &str) -> ExchangeResult<PositionInfo>;

    /// Realized-PnL history for the symbol, in exchange-returned order.
    async fn closed_pnl(&self, symbol: &str) -> ExchangeResult<Vec<ClosedPnlRecord>>;
}

/// Builds an [`ExchangeApi`] client for a user's credential set.
///
/// Each operation receives credentials as parameters; there is no
/// process-wide singleton client.
pub trait ExchangeConnector: Send + Sync {
    fn connect(&self, creds: &ExchangeCredentials) -> ExchangeResult<Arc<dyn ExchangeApi>>;
}

impl ExchangeError {
    /// Helper for integrations that do not serve an operation.
    pub fn unsupported(exchange: &str, operation: &str) -> Self {
        ExchangeError::Unsupported {
            exchange: exchange.to_string(),
            operation: operation.to_string(),
        }
    }
}
