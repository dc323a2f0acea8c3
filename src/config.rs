//! Per-session engine configuration.
//!
//! One immutable `EngineConfig` is built at startup and passed to each
//! session at construction. Sessions never share configuration state, which
//! keeps multi-tenant isolation trivial to reason about.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::models::ExecutionMode;

/// Configuration for sizing, safety limits, stops and order maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // === Capital & sizing ===
    /// Fraction of balance risked per trade before multipliers
    pub base_risk_fraction: Decimal,

    /// Maximum fraction of balance committed to a single symbol
    pub max_position_fraction: Decimal,

    /// Maximum fraction of start-of-day balance that may be lost in one UTC day
    pub max_daily_loss_fraction: Decimal,

    /// Exchange-enforced minimum order value in quote currency
    pub exchange_min_notional: Decimal,

    /// Multiplier applied on top of the exchange minimum when flooring orders
    pub min_notional_buffer: Decimal,

    // === Safety controller ===
    /// Consecutive losses on one symbol before its breaker trips
    pub loss_streak_limit: u32,

    /// Per-symbol breaker cooldown (seconds)
    pub symbol_breaker_cooldown_secs: i64,

    /// Global breaker cooldown (seconds)
    pub global_breaker_cooldown_secs: i64,

    /// Consecutive broker/API failures before approvals are blocked
    pub api_failure_limit: u32,

    /// Volatility above which trades are blocked when stress is elevated
    pub volatility_threshold: f64,

    // === Stop rules ===
    /// Fixed stop distance below average entry
    pub stop_loss_pct: Decimal,

    /// ATR multiple for the ATR stop
    pub atr_stop_multiple: Decimal,

    /// Trailing stop distance below the running peak
    pub trailing_stop_pct: Decimal,

    /// Holding period after which the time stop activates (seconds)
    pub max_holding_secs: i64,

    /// Tightened stop distance once the time stop is active
    pub time_stop_pct: Decimal,

    /// Rolling-volatility multiple for the volatility stop
    pub vol_stop_multiple: Decimal,

    /// Hard cap on the volatility stop distance
    pub vol_stop_max_pct: Decimal,

    // === Take profit / resting orders ===
    /// Profit target above average entry for the resting take-profit
    pub take_profit_pct: Decimal,

    /// Margin added on top of best ask when nudging the take-profit price
    pub spread_margin_pct: Decimal,

    /// Minimum relative price delta before a resting order is repriced
    pub reprice_threshold_pct: Decimal,

    // === Decision arbiter ===
    /// Base weighted-vote threshold before dynamic adjustments
    pub vote_base_threshold: f64,

    /// Lower clamp for the dynamic threshold
    pub vote_threshold_floor: f64,

    /// Upper clamp for the dynamic threshold
    pub vote_threshold_ceiling: f64,

    /// Minimum buy/sell power gap for a directive to fire
    pub vote_min_power_gap: f64,

    // === Ensemble ===
    /// Optional path to offline-trained meta-classifier weights (JSON)
    pub meta_model_path: Option<String>,

    /// Paper or real execution; journaled on every trade record
    pub execution_mode: ExecutionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // Capital & sizing
            base_risk_fraction: dec!(0.05),
            max_position_fraction: dec!(0.20),
            max_daily_loss_fraction: dec!(0.03),
            exchange_min_notional: dec!(10),
            min_notional_buffer: dec!(1.1),

            // Safety
            loss_streak_limit: 3,
            symbol_breaker_cooldown_secs: 1_800,  // 30 min
            global_breaker_cooldown_secs: 3_600,  // 1 hour
            api_failure_limit: 5,
            volatility_threshold: 0.05,

            // Stops
            stop_loss_pct: dec!(0.05),
            atr_stop_multiple: dec!(2),
            trailing_stop_pct: dec!(0.05),
            max_holding_secs: 48 * 3_600,
            time_stop_pct: dec!(0.01),
            vol_stop_multiple: dec!(3),
            vol_stop_max_pct: dec!(0.10),

            // Take profit
            take_profit_pct: dec!(0.03),
            spread_margin_pct: dec!(0.001),
            reprice_threshold_pct: dec!(0.002),

            // Arbiter
            vote_base_threshold: 0.50,
            vote_threshold_floor: 0.35,
            vote_threshold_ceiling: 0.75,
            vote_min_power_gap: 0.10,

            meta_model_path: None,
            execution_mode: ExecutionMode::Paper,
        }
    }
}

impl EngineConfig {
    /// Default configuration with environment overrides applied.
    ///
    /// Only the knobs that operators commonly tune are exposed; everything
    /// else stays at its default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SENTINEL_BASE_RISK_FRACTION") {
            if let Ok(d) = v.parse() {
                cfg.base_risk_fraction = d;
            }
        }
        if let Ok(v) = std::env::var("SENTINEL_MAX_POSITION_FRACTION") {
            if let Ok(d) = v.parse() {
                cfg.max_position_fraction = d;
            }
        }
        if let Ok(v) = std::env::var("SENTINEL_MAX_DAILY_LOSS_FRACTION") {
            if let Ok(d) = v.parse() {
                cfg.max_daily_loss_fraction = d;
            }
        }
        if let Ok(v) = std::env::var("SENTINEL_META_MODEL_PATH") {
            cfg.meta_model_path = Some(v);
        }

        cfg
    }

    /// Reject configurations that cannot produce a working session.
    pub fn validate(&self) -> EngineResult<()> {
        fn fraction(name: &str, value: Decimal) -> EngineResult<()> {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(EngineError::Validation(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
            Ok(())
        }

        fraction("base_risk_fraction", self.base_risk_fraction)?;
        fraction("max_position_fraction", self.max_position_fraction)?;
        fraction("max_daily_loss_fraction", self.max_daily_loss_fraction)?;

        if self.base_risk_fraction > self.max_position_fraction {
            return Err(EngineError::Validation(format!(
                "base_risk_fraction {} exceeds max_position_fraction {}",
                self.base_risk_fraction, self.max_position_fraction
            )));
        }
        if self.exchange_min_notional <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "exchange_min_notional must be positive".to_string(),
            ));
        }
        if self.min_notional_buffer < Decimal::ONE {
            return Err(EngineError::Validation(format!(
                "min_notional_buffer must be at least 1, got {}",
                self.min_notional_buffer
            )));
        }
        if self.loss_streak_limit == 0 {
            return Err(EngineError::Validation(
                "loss_streak_limit must be at least 1".to_string(),
            ));
        }
        if self.symbol_breaker_cooldown_secs <= 0 || self.global_breaker_cooldown_secs <= 0 {
            return Err(EngineError::Validation(
                "breaker cooldowns must be positive".to_string(),
            ));
        }
        if !(self.vote_threshold_floor <= self.vote_base_threshold
            && self.vote_base_threshold <= self.vote_threshold_ceiling)
        {
            return Err(EngineError::Validation(format!(
                "vote thresholds must satisfy floor <= base <= ceiling, got {} / {} / {}",
                self.vote_threshold_floor, self.vote_base_threshold, self.vote_threshold_ceiling
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_fraction_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.base_risk_fraction = dec!(1.5);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_inverted_vote_thresholds_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.vote_threshold_floor = 0.9;
        assert!(cfg.validate().is_err());
    }
}
