//! Bot subscriptions: a user's enrollment in a signal source with
//! allocated capital.

use crate::domain::entities::trade::normalize_symbol;
use serde::{Deserialize, Serialize};

/// One subscription per (user, bot) pair. The traded symbol is derived
/// deterministically from the bot name ("BTC_USDT" -> "BTCUSDT").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: String,
    pub bot_name: String,
    pub symbol: String,
    pub bot_initial_balance: f64,
    /// Running balance after settled PnL, floored at zero.
    pub bot_current_balance: f64,
}

impl Subscription {
    pub fn new(user_id: &str, bot_name: &str, allocated: f64) -> Self {
        Self {
            user_id: user_id.to_string(),
            bot_name: bot_name.to_string(),
            symbol: symbol_for_bot(bot_name),
            bot_initial_balance: allocated,
            bot_current_balance: allocated,
        }
    }
}

/// Derive the traded symbol from a bot name.
pub fn symbol_for_bot(bot_name: &str) -> String {
    normalize_symbol(bot_name)
}
