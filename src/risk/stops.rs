//! Stop-loss evaluation: five independent rules, lowest breached trigger wins.
//!
//! All rules are evaluated against the same position snapshot each cycle.
//! Picking the lowest breached trigger means the exit reason reported is the
//! most conservative rule that would have fired, so journal history stays
//! stable when several rules breach in the same cycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::EngineConfig;
use crate::models::{MarketSnapshot, Position, ReasonCode};

/// A breached stop rule and the trigger price it computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopTrigger {
    pub code: ReasonCode,
    pub trigger_price: Decimal,
}

pub struct StopLossEvaluator {
    config: EngineConfig,
}

impl StopLossEvaluator {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Evaluate every rule and return the breached trigger with the lowest
    /// price, or `None` when the position should be held.
    pub fn evaluate(
        &self,
        position: &Position,
        snapshot: &MarketSnapshot,
        reference_time: Option<DateTime<Utc>>,
    ) -> Option<StopTrigger> {
        let price = snapshot.price;
        let mut breached: Vec<StopTrigger> = Vec::new();

        // Fixed stop below average entry.
        let fixed = position.avg_price * (Decimal::ONE - self.config.stop_loss_pct);
        if price <= fixed {
            breached.push(StopTrigger {
                code: ReasonCode::StopFixed,
                trigger_price: fixed,
            });
        }

        // ATR stop hung off the running peak.
        let atr = snapshot.average_true_range();
        if atr > Decimal::ZERO {
            let atr_stop = position.peak_price - self.config.atr_stop_multiple * atr;
            if price <= atr_stop {
                breached.push(StopTrigger {
                    code: ReasonCode::StopAtr,
                    trigger_price: atr_stop,
                });
            }
        }

        // Trailing stop below the peak.
        let trailing = position.peak_price * (Decimal::ONE - self.config.trailing_stop_pct);
        if price <= trailing {
            breached.push(StopTrigger {
                code: ReasonCode::StopTrailing,
                trigger_price: trailing,
            });
        }

        // Time stop: after the holding period the allowed giveback tightens.
        if position.holding_secs(reference_time) >= self.config.max_holding_secs {
            let time_stop = position.peak_price * (Decimal::ONE - self.config.time_stop_pct);
            if price <= time_stop {
                breached.push(StopTrigger {
                    code: ReasonCode::StopTime,
                    trigger_price: time_stop,
                });
            }
        }

        // Volatility stop: distance scales with realized volatility, capped.
        let vol_distance = Decimal::try_from(snapshot.volatility)
            .unwrap_or(Decimal::ZERO)
            .checked_mul(self.config.vol_stop_multiple)
            .unwrap_or(Decimal::ZERO)
            .min(self.config.vol_stop_max_pct);
        if vol_distance > Decimal::ZERO {
            let vol_stop = position.avg_price * (Decimal::ONE - vol_distance);
            if price <= vol_stop {
                breached.push(StopTrigger {
                    code: ReasonCode::StopVolatility,
                    trigger_price: vol_stop,
                });
            }
        }

        let winner = breached.into_iter().min_by(|a, b| {
            a.trigger_price
                .cmp(&b.trigger_price)
                .then_with(|| a.code.as_str().cmp(b.code.as_str()))
        });

        if let Some(trigger) = &winner {
            debug!(
                symbol = %position.symbol,
                code = trigger.code.as_str(),
                trigger = %trigger.trigger_price,
                price = %price,
                "stop breached"
            );
        }
        winner
    }
}
