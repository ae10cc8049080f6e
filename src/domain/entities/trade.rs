//! Trade records and trade direction.

use crate::domain::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status a trade record starts in. Settlement replaces it with the close
/// reason ("TP", "SL", ...) exactly once; a record never returns to OPEN.
pub const STATUS_OPEN: &str = "OPEN";

/// Trade direction as persisted ("LONG"/"SHORT").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Direction {
    /// Parse a signal direction, case-insensitively.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        match input.to_lowercase().as_str() {
            "long" => Ok(Direction::Long),
            "short" => Ok(Direction::Short),
            _ => Err(ValidationError::InvalidDirection(input.to_string())),
        }
    }

    /// Order side as the exchange expects it.
    pub fn order_side(&self) -> &'static str {
        match self {
            Direction::Long => "Buy",
            Direction::Short => "Sell",
        }
    }

    /// Map an exchange position side ("Buy"/"Sell") back to a direction.
    pub fn from_position_side(side: &str) -> Self {
        if side.eq_ignore_ascii_case("buy") {
            Direction::Long
        } else {
            Direction::Short
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip separator characters so "BTC/USDT", "BTC_USDT" and "BTC-USDT" all
/// persist as "BTCUSDT" — the format the derivatives API expects.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| !matches!(c, '/' | '_' | '-'))
        .collect::<String>()
        .to_uppercase()
}

/// A per-user trade record.
///
/// Created by the trade engine once the exchange confirms the position,
/// mutated exactly once by the settlement reconciler, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub user_id: String,
    pub order_id: Option<String>,
    pub symbol: String,
    pub direction: Direction,
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

impl Trade {
    pub fn is_open(&self) -> bool {
        self.status == STATUS_OPEN
    }
}
