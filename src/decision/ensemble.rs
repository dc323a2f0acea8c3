//! Ensemble combiner: weighted consensus over model outputs, plus a market
//! regime classification and an optional offline-trained meta adjustment.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{MarketSnapshot, SignalKind};

/// One model's opinion for a symbol this cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOutput {
    pub name: String,
    pub signal: SignalKind,

    /// Confidence in [0, 1]
    pub confidence: f64,

    /// Static model weight from training-time evaluation
    pub weight: f64,
}

/// Cross-symbol market regime, derived fresh each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    StrongBull,
    StrongBear,
    Consolidation,
    Mixed,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::StrongBull => "strong_bull",
            MarketRegime::StrongBear => "strong_bear",
            MarketRegime::Consolidation => "consolidation",
            MarketRegime::Mixed => "mixed",
        }
    }

    pub fn is_trending(&self) -> bool {
        matches!(self, MarketRegime::StrongBull | MarketRegime::StrongBear)
    }
}

/// Combined verdict handed to the arbiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleDecision {
    pub signal: SignalKind,
    pub confidence: f64,
    pub buy_ratio: f64,
    pub sell_ratio: f64,

    /// Signed consensus in [-1, 1]; positive favors buying
    pub weighted_consensus: f64,
    pub regime: MarketRegime,
}

/// Offline-trained logistic weights applied as a bounded consensus nudge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaClassifier {
    pub bias: f64,
    pub consensus_weight: f64,
    pub buy_ratio_weight: f64,
    pub volatility_weight: f64,
}

impl MetaClassifier {
    /// Load weights from a JSON file. Any failure degrades to `None`,
    /// which the combiner treats as a zero adjustment.
    pub fn load(path: &str) -> Option<Self> {
        if !Path::new(path).exists() {
            warn!(path = %path, "meta-classifier weights not found, running without");
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<MetaClassifier>(&raw) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!(path = %path, error = %e, "meta-classifier weights unreadable, running without");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path, error = %e, "meta-classifier file unreadable, running without");
                None
            }
        }
    }

    /// Bounded adjustment added to the weighted consensus.
    pub fn adjustment(&self, consensus: f64, buy_ratio: f64, volatility: f64) -> f64 {
        let raw = self.bias
            + self.consensus_weight * consensus
            + self.buy_ratio_weight * (buy_ratio - 0.5)
            + self.volatility_weight * volatility;
        raw.clamp(-0.15, 0.15)
    }
}

pub struct EnsembleCombiner {
    meta: Option<MetaClassifier>,
}

impl EnsembleCombiner {
    pub fn new(meta_model_path: Option<&str>) -> Self {
        let meta = meta_model_path.and_then(MetaClassifier::load);
        Self { meta }
    }

    #[cfg(test)]
    fn with_meta(meta: MetaClassifier) -> Self {
        Self { meta: Some(meta) }
    }

    /// Combine model outputs into one decision for the symbol.
    pub fn combine(
        &self,
        outputs: &[ModelOutput],
        regime: MarketRegime,
        volatility: f64,
    ) -> EnsembleDecision {
        if outputs.is_empty() {
            return EnsembleDecision {
                signal: SignalKind::Hold,
                confidence: 0.0,
                buy_ratio: 0.0,
                sell_ratio: 0.0,
                weighted_consensus: 0.0,
                regime,
            };
        }

        let total_weight: f64 = outputs.iter().map(|o| o.weight).sum();
        if total_weight <= 0.0 {
            return EnsembleDecision {
                signal: SignalKind::Hold,
                confidence: 0.0,
                buy_ratio: 0.0,
                sell_ratio: 0.0,
                weighted_consensus: 0.0,
                regime,
            };
        }

        let mut buy_power = 0.0;
        let mut sell_power = 0.0;
        let mut buy_count = 0usize;
        let mut sell_count = 0usize;
        for out in outputs {
            let power = out.confidence * out.weight;
            if out.signal.is_buy() {
                buy_power += power;
                buy_count += 1;
            } else if out.signal.is_sell() {
                sell_power += power;
                sell_count += 1;
            }
        }

        let mut consensus = (buy_power - sell_power) / total_weight;
        let buy_ratio = buy_count as f64 / outputs.len() as f64;
        let sell_ratio = sell_count as f64 / outputs.len() as f64;

        if let Some(meta) = &self.meta {
            let adj = meta.adjustment(consensus, buy_ratio, volatility);
            debug!(consensus, adjustment = adj, "meta-classifier nudge applied");
            consensus = (consensus + adj).clamp(-1.0, 1.0);
        }

        let signal = if consensus > 0.15 && buy_ratio > 0.7 {
            SignalKind::StrongBuy
        } else if consensus > 0.08 && buy_ratio > 0.6 {
            SignalKind::Buy
        } else if consensus < -0.15 && sell_ratio > 0.7 {
            SignalKind::StrongSell
        } else if consensus < -0.08 && sell_ratio > 0.6 {
            SignalKind::Sell
        } else {
            SignalKind::Hold
        };

        let confidence = consensus.abs().min(1.0);

        EnsembleDecision {
            signal,
            confidence,
            buy_ratio,
            sell_ratio,
            weighted_consensus: consensus,
            regime,
        }
    }

    /// Classify the cross-symbol regime from per-symbol trend strengths.
    pub fn classify_regime(snapshots: &[MarketSnapshot]) -> MarketRegime {
        if snapshots.len() < 3 {
            return MarketRegime::Mixed;
        }

        let trends: Vec<f64> = snapshots.iter().map(|s| s.trend_strength()).collect();

        let rising = trends.iter().filter(|t| **t >= 0.6).count();
        let falling = trends.iter().filter(|t| **t <= -0.6).count();
        let flat = trends.iter().filter(|t| t.abs() < 0.3).count();

        if rising >= 3 && falling == 0 {
            MarketRegime::StrongBull
        } else if falling >= 3 && rising == 0 {
            MarketRegime::StrongBear
        } else if flat >= 3 {
            MarketRegime::Consolidation
        } else {
            MarketRegime::Mixed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn output(signal: SignalKind, confidence: f64, weight: f64) -> ModelOutput {
        ModelOutput {
            name: "m".to_string(),
            signal,
            confidence,
            weight,
        }
    }

    #[test]
    fn test_unanimous_buys_give_strong_buy() {
        let combiner = EnsembleCombiner::new(None);
        let outputs = vec![
            output(SignalKind::Buy, 0.9, 1.0),
            output(SignalKind::StrongBuy, 0.8, 1.0),
            output(SignalKind::Buy, 0.7, 1.0),
        ];
        let decision = combiner.combine(&outputs, MarketRegime::Mixed, 0.01);
        assert_eq!(decision.signal, SignalKind::StrongBuy);
        assert!(decision.weighted_consensus > 0.15);
        assert_eq!(decision.buy_ratio, 1.0);
    }

    #[test]
    fn test_split_opinions_hold() {
        let combiner = EnsembleCombiner::new(None);
        let outputs = vec![
            output(SignalKind::Buy, 0.8, 1.0),
            output(SignalKind::Sell, 0.8, 1.0),
        ];
        let decision = combiner.combine(&outputs, MarketRegime::Mixed, 0.01);
        assert_eq!(decision.signal, SignalKind::Hold);
        assert!(decision.weighted_consensus.abs() < 1e-9);
    }

    #[test]
    fn test_empty_outputs_hold() {
        let combiner = EnsembleCombiner::new(None);
        let decision = combiner.combine(&[], MarketRegime::Mixed, 0.01);
        assert_eq!(decision.signal, SignalKind::Hold);
        assert_eq!(decision.confidence, 0.0);
    }

    #[test]
    fn test_meta_adjustment_is_clamped() {
        let meta = MetaClassifier {
            bias: 5.0,
            consensus_weight: 0.0,
            buy_ratio_weight: 0.0,
            volatility_weight: 0.0,
        };
        assert_eq!(meta.adjustment(0.0, 0.5, 0.01), 0.15);

        let meta = MetaClassifier {
            bias: -5.0,
            consensus_weight: 0.0,
            buy_ratio_weight: 0.0,
            volatility_weight: 0.0,
        };
        assert_eq!(meta.adjustment(0.0, 0.5, 0.01), -0.15);
    }

    #[test]
    fn test_meta_can_flip_marginal_signal() {
        // Consensus 0.10 with buy_ratio 0.75 is a plain Buy... with a
        // +0.15 nudge it crosses the StrongBuy line.
        let combiner = EnsembleCombiner::with_meta(MetaClassifier {
            bias: 5.0,
            consensus_weight: 0.0,
            buy_ratio_weight: 0.0,
            volatility_weight: 0.0,
        });
        let outputs = vec![
            output(SignalKind::Buy, 0.13, 1.0),
            output(SignalKind::Buy, 0.13, 1.0),
            output(SignalKind::Buy, 0.13, 1.0),
            output(SignalKind::Hold, 0.5, 1.0),
        ];
        let decision = combiner.combine(&outputs, MarketRegime::Mixed, 0.01);
        assert_eq!(decision.signal, SignalKind::StrongBuy);
    }

    #[test]
    fn test_missing_meta_file_degrades() {
        let combiner = EnsembleCombiner::new(Some("/nonexistent/meta.json"));
        assert!(combiner.meta.is_none());
    }

    fn snapshot_with_trend(symbol: &str, rising: bool) -> MarketSnapshot {
        let prices: Vec<Decimal> = if rising {
            vec![dec!(100), dec!(101), dec!(102), dec!(103), dec!(104)]
        } else {
            vec![dec!(104), dec!(103), dec!(102), dec!(101), dec!(100)]
        };
        MarketSnapshot {
            symbol: symbol.to_string(),
            price: *prices.last().unwrap(),
            best_bid: dec!(0),
            best_ask: dec!(0),
            volume_24h: dec!(1000),
            prev_volume_24h: dec!(1000),
            volatility: 0.01,
            recent_prices: prices,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_regime_strong_bull() {
        let snaps = vec![
            snapshot_with_trend("A", true),
            snapshot_with_trend("B", true),
            snapshot_with_trend("C", true),
        ];
        assert_eq!(
            EnsembleCombiner::classify_regime(&snaps),
            MarketRegime::StrongBull
        );
    }

    #[test]
    fn test_regime_mixed_on_disagreement() {
        let snaps = vec![
            snapshot_with_trend("A", true),
            snapshot_with_trend("B", false),
            snapshot_with_trend("C", true),
        ];
        assert_eq!(
            EnsembleCombiner::classify_regime(&snaps),
            MarketRegime::Mixed
        );
    }

    #[test]
    fn test_regime_needs_breadth() {
        let snaps = vec![snapshot_with_trend("A", true)];
        assert_eq!(
            EnsembleCombiner::classify_regime(&snaps),
            MarketRegime::Mixed
        );
    }
}
