//! Signal model: the tagged union every provider output is normalized into.
//!
//! Heterogeneous prediction shapes (ensemble decisions, composite scores,
//! single model outputs, raw indicator crossovers) all arrive here as one
//! `SignalRecord` with an explicit source tag; the arbiter's priority and
//! vote weights key off that tag alone.

use serde::{Deserialize, Serialize};

/// Direction and strength of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::StrongBuy => "STRONG_BUY",
            SignalKind::Buy => "BUY",
            SignalKind::Hold => "HOLD",
            SignalKind::Sell => "SELL",
            SignalKind::StrongSell => "STRONG_SELL",
        }
    }

    /// +1 for buys, -1 for sells, 0 for hold.
    pub fn direction(&self) -> i8 {
        match self {
            SignalKind::StrongBuy | SignalKind::Buy => 1,
            SignalKind::StrongSell | SignalKind::Sell => -1,
            SignalKind::Hold => 0,
        }
    }

    pub fn is_buy(&self) -> bool {
        self.direction() > 0
    }

    pub fn is_sell(&self) -> bool {
        self.direction() < 0
    }

    pub fn is_strong(&self) -> bool {
        matches!(self, SignalKind::StrongBuy | SignalKind::StrongSell)
    }
}

impl std::str::FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STRONG_BUY" => Ok(SignalKind::StrongBuy),
            "BUY" => Ok(SignalKind::Buy),
            "HOLD" => Ok(SignalKind::Hold),
            "SELL" => Ok(SignalKind::Sell),
            "STRONG_SELL" => Ok(SignalKind::StrongSell),
            other => Err(format!("unknown signal kind: {other}")),
        }
    }
}

/// Where a signal came from. Priority and vote weight are fixed per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Ensemble,
    Composite,
    Model,
    SingleIndicator,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Ensemble => "ensemble",
            SignalSource::Composite => "composite",
            SignalSource::Model => "model",
            SignalSource::SingleIndicator => "single_indicator",
        }
    }

    /// Base priority used during conflict resolution.
    pub fn base_priority(&self) -> f64 {
        match self {
            SignalSource::Ensemble => 100.0,
            SignalSource::Composite => 80.0,
            SignalSource::Model => 60.0,
            SignalSource::SingleIndicator => 40.0,
        }
    }

    /// Weight a surviving signal carries in the weighted vote.
    pub fn vote_weight(&self) -> f64 {
        match self {
            SignalSource::Ensemble => 1.0,
            SignalSource::Composite => 0.85,
            SignalSource::Model => 0.70,
            SignalSource::SingleIndicator => 0.55,
        }
    }
}

/// One provider output for one symbol in one decision cycle.
///
/// Ephemeral: produced fresh each cycle, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub source: SignalSource,
    pub signal: SignalKind,

    /// Confidence in [0, 1]. Values outside the interval are clamped at
    /// construction.
    pub confidence: f64,

    /// Free-form provider metadata (model name, feature values, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SignalRecord {
    pub fn new(source: SignalSource, signal: SignalKind, confidence: f64) -> Self {
        Self {
            source,
            signal,
            confidence: confidence.clamp(0.0, 1.0),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_priority_ordering() {
        assert!(SignalSource::Ensemble.base_priority() > SignalSource::Composite.base_priority());
        assert!(SignalSource::Composite.base_priority() > SignalSource::Model.base_priority());
        assert!(SignalSource::Model.base_priority() > SignalSource::SingleIndicator.base_priority());
    }

    #[test]
    fn test_confidence_clamped() {
        let rec = SignalRecord::new(SignalSource::Model, SignalKind::Buy, 1.7);
        assert_eq!(rec.confidence, 1.0);
        let rec = SignalRecord::new(SignalSource::Model, SignalKind::Sell, -0.2);
        assert_eq!(rec.confidence, 0.0);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            SignalKind::StrongBuy,
            SignalKind::Buy,
            SignalKind::Hold,
            SignalKind::Sell,
            SignalKind::StrongSell,
        ] {
            let parsed: SignalKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
