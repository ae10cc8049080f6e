//! Signals entering the core and the structured outcomes flowing back out.
//!
//! Outcomes are typed end-to-end; nothing round-trips through a formatted
//! summary string.

use crate::domain::entities::trade::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An instruction to open a position for every subscriber of a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSignal {
    pub symbol: String,
    /// "long"/"short", case-insensitive; validated before fan-out.
    pub direction: String,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Percentage of the allocated capital committed per trade.
    pub investment_per_trade: f64,
    pub amount_multiplier: f64,
}

/// An instruction to close and settle the matching open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSignal {
    pub symbol: String,
    pub direction: String,
    /// Closure reason recorded on the trade ("TP", "SL", ...).
    pub reason: String,
}

/// Per-subscriber result of an open fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SubscriberResult {
    Success {
        order_id: String,
        qty: String,
        entry_price: f64,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberOutcome {
    pub user_id: String,
    #[serde(flatten)]
    pub result: SubscriberResult,
}

/// Aggregate result of `open_trade`: one outcome per processed subscriber,
/// none silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutReport {
    pub processed: usize,
    pub outcomes: Vec<SubscriberOutcome>,
}

impl FanOutReport {
    pub fn successes(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, SubscriberResult::Success { .. }))
            .count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.len() - self.successes()
    }
}

/// Whether a closed-PnL record was conclusively matched to the trade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "matched", content = "pnl")]
pub enum PnlMatch {
    #[serde(rename = "true")]
    Matched(f64),
    #[serde(rename = "false")]
    NoMatch,
}

/// Outcome of `close_trade`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementReport {
    pub symbol: String,
    pub direction: Direction,
    pub trade_id: String,
    pub outcome: SettlementOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// Trade closed with a matched PnL; `balances_updated` is false when the
    /// ledger-side update could not be applied (partial success).
    Settled {
        exit_time: DateTime<Utc>,
        pnl: f64,
        balances_updated: bool,
    },
    /// Trade closed but no PnL record matched; balances untouched.
    ClosedNoMatch { exit_time: DateTime<Utc> },
    /// The trade was closed by an earlier settlement; retry is a no-op.
    AlreadyClosed,
}
