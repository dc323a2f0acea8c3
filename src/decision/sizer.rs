//! Position sizing: a base risk fraction shaped by multiplicative factors,
//! then capped and floored against exchange constraints.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::decision::arbiter::TradeDirective;
use crate::decision::ensemble::MarketRegime;
use crate::risk::profile::RiskProfile;

/// Outcome of sizing: an order, or a reasoned refusal.
#[derive(Debug, Clone, PartialEq)]
pub enum Sizing {
    Order { quantity: Decimal, notional: Decimal },
    Rejected { reason: String },
}

pub struct PositionSizer {
    config: EngineConfig,
}

impl PositionSizer {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Compute the order for a buy directive.
    ///
    /// Factors multiply a base notional of `balance * base_risk_fraction`;
    /// the result is capped by the per-symbol fraction and floored to the
    /// exchange minimum.
    #[allow(clippy::too_many_arguments)]
    pub fn size_buy(
        &self,
        directive: &TradeDirective,
        balance: Decimal,
        price: Decimal,
        confidence: f64,
        profile: RiskProfile,
        regime: MarketRegime,
        volatility: f64,
        portfolio_health: f64,
        stress: f64,
    ) -> Sizing {
        if price <= Decimal::ZERO {
            return Sizing::Rejected {
                reason: "non-positive price".to_string(),
            };
        }

        let base = balance * self.config.base_risk_fraction;

        let confidence_factor = (confidence * 1.5).min(1.2);
        let ensemble_boost = match directive {
            TradeDirective::StrongBuy => 1.3,
            TradeDirective::Buy => 1.15,
            _ => 1.0,
        };
        let vol_adjustment = volatility_adjustment(volatility);
        let regime_adjustment = match regime {
            MarketRegime::StrongBull => 1.2,
            MarketRegime::StrongBear => 0.7,
            MarketRegime::Mixed => 0.85,
            MarketRegime::Consolidation => 1.0,
        };
        let health_factor = (0.5 + portfolio_health).clamp(0.5, 1.5);
        let stress_factor = 1.0 - 0.5 * stress.clamp(0.0, 1.0);

        let scalar = confidence_factor
            * ensemble_boost
            * vol_adjustment
            * regime_adjustment
            * health_factor
            * stress_factor;
        let scalar = Decimal::from_f64(scalar).unwrap_or(Decimal::ONE);

        let mut notional = (base * profile.risk_multiplier() * scalar).round_dp(8);

        let cap = balance * self.config.max_position_fraction;
        if notional > cap {
            debug!(notional = %notional, cap = %cap, "sized notional capped");
            notional = cap;
        }

        let floor = self.config.exchange_min_notional * self.config.min_notional_buffer;
        if notional < floor {
            if floor > cap {
                return Sizing::Rejected {
                    reason: format!("min notional {floor} exceeds position cap {cap}"),
                };
            }
            info!(notional = %notional, floor = %floor, "sized notional floored to exchange minimum");
            notional = floor;
        }

        if notional > balance {
            return Sizing::Rejected {
                reason: format!("notional {notional} exceeds balance {balance}"),
            };
        }

        let quantity = (notional / price).round_dp(8);
        Sizing::Order { quantity, notional }
    }
}

/// Linear taper: full-plus sizing in quiet tape, deep cut in violent tape.
fn volatility_adjustment(volatility: f64) -> f64 {
    if volatility < 0.01 {
        1.2
    } else if volatility > 0.08 {
        0.6
    } else {
        // Interpolate from 1.2 at 1% down to 0.6 at 8%.
        1.2 - (volatility - 0.01) / 0.07 * 0.6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sizer() -> PositionSizer {
        PositionSizer::new(EngineConfig::default())
    }

    fn size(
        s: &PositionSizer,
        directive: TradeDirective,
        balance: Decimal,
        confidence: f64,
        profile: RiskProfile,
        stress: f64,
    ) -> Sizing {
        s.size_buy(
            &directive,
            balance,
            dec!(100),
            confidence,
            profile,
            MarketRegime::Consolidation,
            0.02,
            1.0,
            stress,
        )
    }

    #[test]
    fn test_moderate_buy_produces_order() {
        let sizing = size(
            &sizer(),
            TradeDirective::Buy,
            dec!(10000),
            0.7,
            RiskProfile::Moderate,
            0.0,
        );
        match sizing {
            Sizing::Order { quantity, notional } => {
                assert!(notional > dec!(100));
                assert!(notional <= dec!(2000)); // 20% cap
                assert_eq!(quantity, (notional / dec!(100)).round_dp(8));
            }
            Sizing::Rejected { reason } => panic!("rejected: {reason}"),
        }
    }

    #[test]
    fn test_strong_buy_sized_larger_than_buy() {
        let s = sizer();
        let buy = size(&s, TradeDirective::Buy, dec!(10000), 0.7, RiskProfile::Moderate, 0.0);
        let strong = size(
            &s,
            TradeDirective::StrongBuy,
            dec!(10000),
            0.7,
            RiskProfile::Moderate,
            0.0,
        );
        let (Sizing::Order { notional: n_buy, .. }, Sizing::Order { notional: n_strong, .. }) =
            (buy, strong)
        else {
            panic!("expected orders");
        };
        assert!(n_strong > n_buy);
    }

    #[test]
    fn test_conservative_smaller_than_aggressive() {
        let s = sizer();
        let cons = size(&s, TradeDirective::Buy, dec!(10000), 0.7, RiskProfile::Conservative, 0.0);
        let aggr = size(&s, TradeDirective::Buy, dec!(10000), 0.7, RiskProfile::Aggressive, 0.0);
        let (Sizing::Order { notional: n_cons, .. }, Sizing::Order { notional: n_aggr, .. }) =
            (cons, aggr)
        else {
            panic!("expected orders");
        };
        assert!(n_cons < n_aggr);
    }

    #[test]
    fn test_stress_shrinks_size() {
        let s = sizer();
        let calm = size(&s, TradeDirective::Buy, dec!(10000), 0.7, RiskProfile::Moderate, 0.0);
        let stressed = size(&s, TradeDirective::Buy, dec!(10000), 0.7, RiskProfile::Moderate, 0.8);
        let (Sizing::Order { notional: n_calm, .. }, Sizing::Order { notional: n_str, .. }) =
            (calm, stressed)
        else {
            panic!("expected orders");
        };
        assert!(n_str < n_calm);
    }

    #[test]
    fn test_cap_binds_large_factors() {
        // Aggressive profile, strong buy, high confidence on a small cap.
        let sizing = size(
            &sizer(),
            TradeDirective::StrongBuy,
            dec!(1000),
            0.95,
            RiskProfile::Aggressive,
            0.0,
        );
        match sizing {
            Sizing::Order { notional, .. } => assert!(notional <= dec!(200)),
            Sizing::Rejected { reason } => panic!("rejected: {reason}"),
        }
    }

    #[test]
    fn test_tiny_balance_floors_then_rejects() {
        let s = sizer();
        // Balance 100: base notional 5 * factors is tiny; floor is 11
        // (min notional 10 * 1.1), cap is 20, so it floors to 11.
        let sizing = size(&s, TradeDirective::Buy, dec!(100), 0.7, RiskProfile::Moderate, 0.0);
        match sizing {
            Sizing::Order { notional, .. } => assert_eq!(notional, dec!(11.0)),
            Sizing::Rejected { reason } => panic!("rejected: {reason}"),
        }

        // Balance 50: cap 10 is below the floor 11; nothing sizable.
        let sizing = size(&s, TradeDirective::Buy, dec!(50), 0.7, RiskProfile::Moderate, 0.0);
        assert!(matches!(sizing, Sizing::Rejected { .. }));
    }
}
