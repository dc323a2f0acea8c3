//! Position model representing the session's current holdings in a symbol.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An open long position in one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,

    /// Base-asset quantity currently held
    pub quantity: Decimal,

    /// Weighted-average entry price in quote currency
    pub avg_price: Decimal,

    /// When the position was first opened
    pub entry_time: DateTime<Utc>,

    /// Profit target for the resting take-profit order
    pub take_profit_price: Decimal,

    /// Fixed stop level set at entry
    pub stop_loss_price: Decimal,

    /// Confidence of the signal that opened (or last added to) the position
    pub signal_strength: f64,

    /// Highest price observed since entry; only ever ratchets upward
    pub peak_price: Decimal,
}

impl Position {
    pub fn new(
        symbol: String,
        quantity: Decimal,
        price: Decimal,
        take_profit_price: Decimal,
        stop_loss_price: Decimal,
        signal_strength: f64,
    ) -> Self {
        Self {
            symbol,
            quantity,
            avg_price: price,
            entry_time: Utc::now(),
            take_profit_price,
            stop_loss_price,
            signal_strength,
            peak_price: price,
        }
    }

    /// Add to the position, recomputing the weighted-average entry price.
    pub fn add(&mut self, quantity: Decimal, price: Decimal, signal_strength: f64) {
        let total_cost = self.quantity * self.avg_price + quantity * price;
        let new_quantity = self.quantity + quantity;

        if !new_quantity.is_zero() {
            self.avg_price = total_cost / new_quantity;
        }

        self.quantity = new_quantity;
        self.signal_strength = signal_strength;
        self.update_peak(price);
    }

    /// Reduce the position and return the realized P&L of the sold slice.
    pub fn reduce(&mut self, quantity: Decimal, price: Decimal) -> Decimal {
        let sold = quantity.min(self.quantity);
        let realized_pnl = sold * (price - self.avg_price);
        self.quantity -= sold;
        realized_pnl
    }

    /// Ratchet the peak price. Never moves down.
    pub fn update_peak(&mut self, price: Decimal) {
        if price > self.peak_price {
            self.peak_price = price;
        }
    }

    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        self.quantity * (current_price - self.avg_price)
    }

    pub fn notional(&self, current_price: Decimal) -> Decimal {
        self.quantity * current_price
    }

    /// Seconds the position has been held, against an optional reference
    /// instant for deterministic tests.
    pub fn holding_secs(&self, reference_time: Option<DateTime<Utc>>) -> i64 {
        let now = reference_time.unwrap_or_else(Utc::now);
        (now - self.entry_time).num_seconds()
    }

    /// Closed when the remaining quantity is dust.
    pub fn is_closed(&self) -> bool {
        self.quantity < Decimal::new(1, 6)
    }
}

/// A resting take-profit limit order tracked alongside its position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestingOrder {
    pub symbol: String,

    /// Broker-assigned order id
    pub order_id: String,

    /// Limit price the order currently rests at
    pub target_price: Decimal,

    pub quantity: Decimal,

    pub created_at: DateTime<Utc>,

    /// Last maintenance pass that examined this order
    pub last_checked: DateTime<Utc>,
}

impl RestingOrder {
    pub fn new(symbol: String, order_id: String, target_price: Decimal, quantity: Decimal) -> Self {
        let now = Utc::now();
        Self {
            symbol,
            order_id,
            target_price,
            quantity,
            created_at: now,
            last_checked: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_position() -> Position {
        Position::new(
            "BTCUSDT".to_string(),
            dec!(0.5),
            dec!(100),
            dec!(103),
            dec!(95),
            0.8,
        )
    }

    #[test]
    fn test_weighted_average_add() {
        let mut pos = make_position();
        pos.add(dec!(0.5), dec!(120), 0.9);

        assert_eq!(pos.quantity, dec!(1.0));
        // (0.5*100 + 0.5*120) / 1.0 = 110
        assert_eq!(pos.avg_price, dec!(110));
        assert_eq!(pos.signal_strength, 0.9);
    }

    #[test]
    fn test_reduce_realizes_pnl() {
        let mut pos = make_position();
        let pnl = pos.reduce(dec!(0.2), dec!(110));

        // 0.2 * (110 - 100) = 2
        assert_eq!(pnl, dec!(2));
        assert_eq!(pos.quantity, dec!(0.3));
        // Average entry is untouched by a partial sell
        assert_eq!(pos.avg_price, dec!(100));
    }

    #[test]
    fn test_reduce_clamps_to_held_quantity() {
        let mut pos = make_position();
        let pnl = pos.reduce(dec!(5), dec!(110));

        assert_eq!(pnl, dec!(5));
        assert!(pos.is_closed());
    }

    #[test]
    fn test_peak_only_ratchets_up() {
        let mut pos = make_position();
        pos.update_peak(dec!(130));
        assert_eq!(pos.peak_price, dec!(130));

        pos.update_peak(dec!(90));
        assert_eq!(pos.peak_price, dec!(130));
    }
}
