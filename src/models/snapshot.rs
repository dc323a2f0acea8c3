//! Market snapshot consumed by the stress composite, regime classifier,
//! stop evaluator and sizer.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One symbol's market view for the current decision cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,

    /// Last trade price
    pub price: Decimal,

    pub best_bid: Decimal,
    pub best_ask: Decimal,

    /// Rolling 24h quote volume
    pub volume_24h: Decimal,

    /// The previous cycle's 24h volume, for the change fraction
    pub prev_volume_24h: Decimal,

    /// Realized volatility over the recent window, as a fraction
    pub volatility: f64,

    /// Most recent closes, oldest first
    pub recent_prices: Vec<Decimal>,

    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Log returns of the recent price window, oldest first.
    pub fn log_returns(&self) -> Vec<f64> {
        self.recent_prices
            .windows(2)
            .filter_map(|w| {
                let prev = w[0].to_f64()?;
                let curr = w[1].to_f64()?;
                if prev > 0.0 && curr > 0.0 {
                    Some((curr / prev).ln())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Relative 24h volume change against the previous cycle.
    pub fn volume_change_fraction(&self) -> f64 {
        let prev = self.prev_volume_24h.to_f64().unwrap_or(0.0);
        let curr = self.volume_24h.to_f64().unwrap_or(0.0);
        if prev <= 0.0 {
            return 0.0;
        }
        (curr - prev) / prev
    }

    /// Pearson correlation of price against its index position. Close to
    /// +1/-1 means a clean trend, near zero means chop.
    pub fn trend_strength(&self) -> f64 {
        let prices: Vec<f64> = self
            .recent_prices
            .iter()
            .filter_map(|p| p.to_f64())
            .collect();
        let n = prices.len();
        if n < 3 {
            return 0.0;
        }

        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let mean_x = xs.iter().sum::<f64>() / n as f64;
        let mean_y = prices.iter().sum::<f64>() / n as f64;

        let mut cov = 0.0;
        let mut var_x = 0.0;
        let mut var_y = 0.0;
        for i in 0..n {
            let dx = xs[i] - mean_x;
            let dy = prices[i] - mean_y;
            cov += dx * dy;
            var_x += dx * dx;
            var_y += dy * dy;
        }

        if var_x <= 0.0 || var_y <= 0.0 {
            return 0.0;
        }
        cov / (var_x.sqrt() * var_y.sqrt())
    }

    /// Mean absolute price change over the window, a cheap ATR stand-in.
    pub fn average_true_range(&self) -> Decimal {
        if self.recent_prices.len() < 2 {
            return Decimal::ZERO;
        }
        let mut total = Decimal::ZERO;
        let mut count = 0;
        for w in self.recent_prices.windows(2) {
            let diff = w[1] - w[0];
            total += diff.abs();
            count += 1;
        }
        if count == 0 {
            Decimal::ZERO
        } else {
            total / Decimal::from(count)
        }
    }

    /// Mid of the top of book, falling back to last price.
    pub fn mid_price(&self) -> Decimal {
        if self.best_bid.is_zero() || self.best_ask.is_zero() {
            self.price
        } else {
            (self.best_bid + self.best_ask) / Decimal::TWO
        }
    }
}
