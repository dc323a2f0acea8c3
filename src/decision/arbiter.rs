//! Signal arbiter: prioritize, drop conflicts, run the weighted vote.
//!
//! The pipeline is deterministic for a given input set: priorities are
//! computed from fixed tables plus context bonuses, conflicting lower
//! priority signals are dropped, and the surviving signals vote with
//! weights scaled by confidence and stress. The vote only fires when the
//! winning side clears a dynamically adjusted threshold AND leads the
//! opposing side by a minimum gap.

use tracing::debug;

use crate::config::EngineConfig;
use crate::decision::ensemble::EnsembleDecision;
use crate::models::{SignalKind, SignalRecord};

/// The arbiter's verdict for one symbol this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeDirective {
    StrongBuy,
    Buy,
    Sell,
    StrongSell,
    Hold { reason: String },
}

impl TradeDirective {
    pub fn is_buy(&self) -> bool {
        matches!(self, TradeDirective::StrongBuy | TradeDirective::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, TradeDirective::StrongSell | TradeDirective::Sell)
    }

    pub fn is_strong(&self) -> bool {
        matches!(self, TradeDirective::StrongBuy | TradeDirective::StrongSell)
    }

    fn hold(reason: impl Into<String>) -> Self {
        TradeDirective::Hold {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct RankedSignal {
    record: SignalRecord,
    priority: f64,
}

pub struct SignalArbiter {
    config: EngineConfig,
}

impl SignalArbiter {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Run the full pipeline. `has_position` gates sell directives, since a
    /// sell with nothing to sell is meaningless.
    pub fn decide(
        &self,
        signals: &[SignalRecord],
        ensemble: &EnsembleDecision,
        stress: f64,
        has_position: bool,
    ) -> TradeDirective {
        let directional: Vec<&SignalRecord> = signals
            .iter()
            .filter(|s| s.signal.direction() != 0)
            .collect();
        if directional.is_empty() {
            return TradeDirective::hold("no directional signals");
        }

        let ranked = self.rank(&directional, ensemble, stress);
        let survivors = drop_conflicts(ranked);

        let mut buy_weight = 0.0;
        let mut sell_weight = 0.0;
        for s in &survivors {
            let mut weight = s.record.confidence * s.record.source.vote_weight();
            if s.record.signal.is_strong() {
                weight *= 1.3;
            }
            if stress > 0.6 {
                weight *= 0.7;
            }
            if s.record.signal.is_buy() {
                buy_weight += weight;
            } else {
                sell_weight += weight;
            }
        }

        let total = buy_weight + sell_weight;
        if total <= 0.0 {
            return TradeDirective::hold("zero vote weight");
        }
        let buy_power = buy_weight / total;
        let sell_power = sell_weight / total;
        let gap = (buy_power - sell_power).abs();

        let threshold = self.dynamic_threshold(ensemble, stress);
        debug!(
            buy_power,
            sell_power,
            gap,
            threshold,
            survivors = survivors.len(),
            "weighted vote"
        );

        // A panicking market with a narrow vote is not worth acting on.
        if stress > 0.8 && gap < 0.2 {
            return TradeDirective::hold(format!("stress veto: stress {stress:.2}, gap {gap:.2}"));
        }

        if gap < self.config.vote_min_power_gap {
            return TradeDirective::hold(format!("power gap {gap:.2} below minimum"));
        }

        let (winning_power, winning_is_buy) = if buy_power > sell_power {
            (buy_power, true)
        } else {
            (sell_power, false)
        };

        if winning_power < threshold {
            return TradeDirective::hold(format!(
                "power {winning_power:.2} below threshold {threshold:.2}"
            ));
        }

        // The ensemble gets a veto over directives it confidently opposes.
        let ensemble_dir = ensemble.signal.direction();
        let directive_dir = if winning_is_buy { 1 } else { -1 };
        if ensemble_dir != 0 && ensemble_dir != directive_dir && ensemble.confidence > 0.6 {
            return TradeDirective::hold(format!(
                "ensemble opposes with confidence {:.2}",
                ensemble.confidence
            ));
        }

        let strong = winning_power >= threshold + 0.15;
        if winning_is_buy {
            if strong {
                TradeDirective::StrongBuy
            } else {
                TradeDirective::Buy
            }
        } else if !has_position {
            TradeDirective::hold("no position to sell")
        } else if strong {
            TradeDirective::StrongSell
        } else {
            TradeDirective::Sell
        }
    }

    fn rank(
        &self,
        signals: &[&SignalRecord],
        ensemble: &EnsembleDecision,
        stress: f64,
    ) -> Vec<RankedSignal> {
        signals
            .iter()
            .map(|record| {
                let mut priority = record.source.base_priority();

                if record.confidence >= 0.8 {
                    priority += 15.0;
                } else if record.confidence >= 0.6 {
                    priority += 8.0;
                }
                if record.signal.is_strong() {
                    priority += 10.0;
                }

                // Agreement with the rest of the field.
                let same = signals
                    .iter()
                    .filter(|o| o.signal.direction() == record.signal.direction())
                    .count();
                if same * 2 > signals.len() {
                    priority += 5.0;
                }

                // Context bonuses: trend alignment, and caution under stress.
                let regime_dir = match ensemble.regime {
                    crate::decision::ensemble::MarketRegime::StrongBull => 1,
                    crate::decision::ensemble::MarketRegime::StrongBear => -1,
                    _ => 0,
                };
                if regime_dir != 0 && regime_dir == record.signal.direction() as i32 {
                    priority += 5.0;
                }
                if stress > 0.6 && record.signal.is_sell() {
                    priority += 5.0;
                }

                RankedSignal {
                    record: (*record).clone(),
                    priority,
                }
            })
            .collect()
    }

    fn dynamic_threshold(&self, ensemble: &EnsembleDecision, stress: f64) -> f64 {
        let mut threshold = self.config.vote_base_threshold;

        if stress > 0.7 {
            threshold += 0.08;
        } else if stress > 0.5 {
            threshold += 0.04;
        }

        if ensemble.confidence > 0.8 {
            threshold -= 0.03;
        } else if ensemble.confidence < 0.5 {
            threshold += 0.05;
        }

        if ensemble.regime.is_trending() {
            threshold -= 0.015;
        } else if ensemble.regime == crate::decision::ensemble::MarketRegime::Mixed {
            threshold += 0.025;
        }

        threshold.clamp(
            self.config.vote_threshold_floor,
            self.config.vote_threshold_ceiling,
        )
    }
}

/// Drop every signal that has a strictly-higher-priority opponent.
fn drop_conflicts(ranked: Vec<RankedSignal>) -> Vec<RankedSignal> {
    let max_buy = ranked
        .iter()
        .filter(|s| s.record.signal.is_buy())
        .map(|s| s.priority)
        .fold(f64::NEG_INFINITY, f64::max);
    let max_sell = ranked
        .iter()
        .filter(|s| s.record.signal.is_sell())
        .map(|s| s.priority)
        .fold(f64::NEG_INFINITY, f64::max);

    ranked
        .into_iter()
        .filter(|s| {
            let opposing_max = if s.record.signal.is_buy() {
                max_sell
            } else {
                max_buy
            };
            s.priority >= opposing_max
        })
        .collect()
}
