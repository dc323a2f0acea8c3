//! Market stress composite and risk-profile classification.
//!
//! The stress score feeds the arbiter's dynamic threshold and the sizer's
//! stress factor; the profile's multiplier scales every order's base risk.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::MarketSnapshot;

/// Portfolio posture. The multiplier scales position sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskProfile {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskProfile {
    pub fn risk_multiplier(&self) -> Decimal {
        match self {
            RiskProfile::Conservative => Decimal::new(7, 1),
            RiskProfile::Moderate => Decimal::ONE,
            RiskProfile::Aggressive => Decimal::new(13, 1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskProfile::Conservative => "conservative",
            RiskProfile::Moderate => "moderate",
            RiskProfile::Aggressive => "aggressive",
        }
    }
}

/// Banded view of the stress composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StressLevel {
    Normal,
    Elevated,
    HighStress,
}

impl StressLevel {
    pub fn from_score(score: f64) -> Self {
        if score > 0.7 {
            StressLevel::HighStress
        } else if score > 0.4 {
            StressLevel::Elevated
        } else {
            StressLevel::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StressLevel::Normal => "normal",
            StressLevel::Elevated => "elevated",
            StressLevel::HighStress => "high_stress",
        }
    }
}

/// Recomputes stress and profile once per decision cycle.
#[derive(Debug, Clone)]
pub struct RiskProfileEngine {
    profile: RiskProfile,
    stress: f64,
}

impl Default for RiskProfileEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RiskProfileEngine {
    pub fn new() -> Self {
        Self {
            profile: RiskProfile::Moderate,
            stress: 0.0,
        }
    }

    pub fn profile(&self) -> RiskProfile {
        self.profile
    }

    pub fn stress(&self) -> f64 {
        self.stress
    }

    pub fn stress_level(&self) -> StressLevel {
        StressLevel::from_score(self.stress)
    }

    /// Composite of realized volatility, cross-symbol correlation and
    /// volume surges, each normalized into [0, 1] and averaged.
    pub fn compute_market_stress(&mut self, snapshots: &[MarketSnapshot]) -> f64 {
        if snapshots.is_empty() {
            self.stress = 0.0;
            return self.stress;
        }

        let return_series: Vec<Vec<f64>> =
            snapshots.iter().map(|s| s.log_returns()).collect();

        let vol_component = {
            let vols: Vec<f64> = return_series
                .iter()
                .filter(|r| r.len() >= 2)
                .map(|r| stddev(r))
                .collect();
            if vols.is_empty() {
                0.0
            } else {
                // A 2% per-bar realized vol saturates the component.
                (mean(&vols) / 0.02).clamp(0.0, 1.0)
            }
        };

        let correlation_component = {
            let mut pair_corrs = Vec::new();
            for i in 0..return_series.len() {
                for j in (i + 1)..return_series.len() {
                    let a = &return_series[i];
                    let b = &return_series[j];
                    let n = a.len().min(b.len());
                    if n >= 3 {
                        pair_corrs.push(pearson(&a[..n], &b[..n]).abs());
                    }
                }
            }
            if pair_corrs.is_empty() {
                0.0
            } else {
                // Lockstep markets above 0.5 average |corr| read as stress.
                ((mean(&pair_corrs) - 0.5) * 2.0).clamp(0.0, 1.0)
            }
        };

        let volume_component = {
            let changes: Vec<f64> = snapshots
                .iter()
                .map(|s| s.volume_change_fraction().abs())
                .collect();
            mean(&changes).clamp(0.0, 1.0)
        };

        self.stress = (vol_component + correlation_component + volume_component) / 3.0;
        debug!(
            vol = vol_component,
            corr = correlation_component,
            volume = volume_component,
            stress = self.stress,
            "market stress recomputed"
        );
        self.stress
    }

    /// Classify from recent portfolio performance; elevated stress forces
    /// the conservative profile regardless of performance.
    pub fn adjust_profile(
        &mut self,
        portfolio_return: Decimal,
        max_drawdown: Decimal,
        portfolio_volatility: f64,
    ) -> RiskProfile {
        let ret = portfolio_return.to_f64().unwrap_or(0.0);
        let dd = max_drawdown.to_f64().unwrap_or(0.0);

        let performance_profile = if dd > 0.08 {
            RiskProfile::Conservative
        } else if ret > 0.15 && portfolio_volatility < 0.03 {
            RiskProfile::Aggressive
        } else {
            RiskProfile::Moderate
        };

        self.profile = if self.stress > 0.6 || self.stress_level() == StressLevel::HighStress {
            RiskProfile::Conservative
        } else {
            performance_profile
        };

        debug!(
            profile = self.profile.as_str(),
            stress = self.stress,
            drawdown = dd,
            "risk profile adjusted"
        );
        self.profile
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn stddev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let ma = mean(&a[..n]);
    let mb = mean(&b[..n]);
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for i in 0..n {
        let da = a[i] - ma;
        let db = b[i] - mb;
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    if va <= 0.0 || vb <= 0.0 {
        return 0.0;
    }
    cov / (va.sqrt() * vb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn make_snapshot(symbol: &str, prices: &[f64], vol_change: f64) -> MarketSnapshot {
        let recent: Vec<Decimal> = prices
            .iter()
            .map(|p| Decimal::try_from(*p).unwrap())
            .collect();
        MarketSnapshot {
            symbol: symbol.to_string(),
            price: *recent.last().unwrap(),
            best_bid: dec!(0),
            best_ask: dec!(0),
            volume_24h: Decimal::try_from(1000.0 * (1.0 + vol_change)).unwrap(),
            prev_volume_24h: dec!(1000),
            volatility: 0.01,
            recent_prices: recent,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_calm_market_low_stress() {
        let mut engine = RiskProfileEngine::new();
        let snaps = vec![
            make_snapshot("BTCUSDT", &[100.0, 100.1, 100.05, 100.12, 100.08], 0.01),
            make_snapshot("ETHUSDT", &[50.0, 49.98, 50.03, 50.01, 50.05], 0.02),
        ];
        let stress = engine.compute_market_stress(&snaps);
        assert!(stress < 0.4, "stress was {stress}");
        assert_eq!(engine.stress_level(), StressLevel::Normal);
    }

    #[test]
    fn test_volatile_lockstep_market_high_stress() {
        let mut engine = RiskProfileEngine::new();
        // Large identical swings: max vol component and |corr| = 1.
        let snaps = vec![
            make_snapshot("BTCUSDT", &[100.0, 95.0, 103.0, 96.0, 105.0], 0.9),
            make_snapshot("ETHUSDT", &[50.0, 47.5, 51.5, 48.0, 52.5], 0.9),
        ];
        let stress = engine.compute_market_stress(&snaps);
        assert!(stress > 0.7, "stress was {stress}");
        assert_eq!(engine.stress_level(), StressLevel::HighStress);
    }

    #[test]
    fn test_drawdown_forces_conservative() {
        let mut engine = RiskProfileEngine::new();
        let profile = engine.adjust_profile(dec!(0.20), dec!(0.10), 0.01);
        assert_eq!(profile, RiskProfile::Conservative);
    }

    #[test]
    fn test_strong_calm_performance_goes_aggressive() {
        let mut engine = RiskProfileEngine::new();
        let profile = engine.adjust_profile(dec!(0.20), dec!(0.02), 0.01);
        assert_eq!(profile, RiskProfile::Aggressive);
    }

    #[test]
    fn test_stress_overrides_performance() {
        let mut engine = RiskProfileEngine::new();
        engine.stress = 0.75;
        let profile = engine.adjust_profile(dec!(0.20), dec!(0.02), 0.01);
        assert_eq!(profile, RiskProfile::Conservative);
    }
}
