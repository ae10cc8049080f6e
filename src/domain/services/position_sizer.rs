//! Position sizing service
//!
//! Converts allocated capital + percentage-per-trade + multiplier into an
//! exchange-compliant order quantity, respecting the instrument's step size,
//! minimum quantity and the configured minimum notional.

use crate::domain::errors::ValidationError;
use crate::domain::repositories::exchange_api::InstrumentInfo;

/// Default minimum notional in USDT, overridable via configuration.
pub const DEFAULT_MIN_NOTIONAL: f64 = 20.0;

#[derive(Debug, Clone, Copy)]
pub struct SizingRequest {
    /// Capital allocated to the bot for this subscriber.
    pub capital: f64,
    /// Percentage of that capital committed per trade.
    pub percentage: f64,
    pub multiplier: f64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SizingOutcome {
    /// An order can be placed with this exchange-exact quantity string.
    Order {
        qty: String,
        quantity: f64,
        notional: f64,
    },
    /// The adjusted quantity is worth less than the minimum notional; no
    /// order should be placed.
    BelowMinNotional { notional: f64 },
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    min_notional: f64,
}

impl PositionSizer {
    pub fn new(min_notional: f64) -> Self {
        Self { min_notional }
    }

    /// Size an order against the instrument's constraints.
    ///
    /// The quantity is rounded to the nearest step, floored at the exchange
    /// minimum, then rejected if the resulting notional is below the
    /// configured minimum. Deterministic: identical inputs always produce
    /// the identical outcome.
    pub fn size(
        &self,
        req: &SizingRequest,
        instrument: &InstrumentInfo,
    ) -> Result<SizingOutcome, ValidationError> {
        if !(req.price > 0.0) {
            return Err(ValidationError::InvalidAmount(format!(
                "price must be positive, got {}",
                req.price
            )));
        }
        if !(instrument.qty_step > 0.0) {
            return Err(ValidationError::InvalidAmount(format!(
                "quantity step must be positive, got {}",
                instrument.qty_step
            )));
        }

        let usdt_amount = req.capital * (req.percentage / 100.0) * req.multiplier;
        let raw_qty = usdt_amount / req.price;
        let step = instrument.qty_step;
        let adjusted = ((raw_qty / step).round() * step).max(instrument.min_order_qty);
        let notional = adjusted * req.price;

        if notional < self.min_notional {
            return Ok(SizingOutcome::BelowMinNotional { notional });
        }

        Ok(SizingOutcome::Order {
            qty: format_quantity(adjusted, step),
            quantity: adjusted,
            notional,
        })
    }
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_NOTIONAL)
    }
}

/// Format a quantity with exactly the decimal places the step size implies,
/// trimming trailing zeros. This string must match what the exchange
/// accepts; formatting errors cause order rejection.
pub fn format_quantity(qty: f64, step: f64) -> String {
    let decimals = if step < 1.0 {
        (-step.log10()).round() as usize
    } else {
        0
    };
    let formatted = format!("{:.*}", decimals, qty);
    if formatted.contains('.') {
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        formatted
    }
}
