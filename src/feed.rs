//! Synthetic market feed for paper sessions.
//!
//! Prices follow a bounded random walk; provider signals and model outputs
//! are derived from the walk's own momentum so the decision pipeline sees
//! internally consistent inputs. The feed is the paper-mode stand-in for a
//! live exchange data stream.

use std::collections::HashMap;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::decision::ModelOutput;
use crate::models::{MarketSnapshot, SignalKind, SignalRecord, SignalSource};

const HISTORY_LEN: usize = 20;

/// One cycle's worth of market data and derived opinions.
pub struct FeedCycle {
    pub snapshots: Vec<MarketSnapshot>,
    pub signals: HashMap<String, Vec<SignalRecord>>,
    pub model_outputs: HashMap<String, Vec<ModelOutput>>,
}

struct SymbolState {
    symbol: String,
    price: f64,
    history: Vec<f64>,
    volume: f64,
    prev_volume: f64,
}

pub struct PaperFeed {
    rng: StdRng,
    symbols: Vec<SymbolState>,
}

impl PaperFeed {
    pub fn new(symbols: &[String]) -> Self {
        Self::with_seed(symbols, rand::random())
    }

    /// Seeded constructor so tests can replay a walk.
    pub fn with_seed(symbols: &[String], seed: u64) -> Self {
        let symbols = symbols
            .iter()
            .map(|s| {
                let price = starting_price(s);
                SymbolState {
                    symbol: s.clone(),
                    price,
                    history: vec![price],
                    volume: 1_000_000.0,
                    prev_volume: 1_000_000.0,
                }
            })
            .collect();
        Self {
            rng: StdRng::seed_from_u64(seed),
            symbols,
        }
    }

    /// Advance every symbol one step and derive this cycle's inputs.
    pub fn next_cycle(&mut self) -> FeedCycle {
        let mut snapshots = Vec::with_capacity(self.symbols.len());
        let mut signals = HashMap::new();
        let mut model_outputs = HashMap::new();

        for state in &mut self.symbols {
            let step: f64 = self.rng.gen_range(-0.012..0.012);
            state.price *= 1.0 + step;
            state.history.push(state.price);
            if state.history.len() > HISTORY_LEN {
                state.history.remove(0);
            }

            state.prev_volume = state.volume;
            let volume_step: f64 = self.rng.gen_range(-0.15..0.15);
            state.volume *= 1.0 + volume_step;

            let volatility = realized_volatility(&state.history);
            let momentum = momentum(&state.history);

            snapshots.push(MarketSnapshot {
                symbol: state.symbol.clone(),
                price: to_decimal(state.price),
                best_bid: to_decimal(state.price * 0.9995),
                best_ask: to_decimal(state.price * 1.0005),
                volume_24h: to_decimal(state.volume),
                prev_volume_24h: to_decimal(state.prev_volume),
                volatility,
                recent_prices: state.history.iter().copied().map(to_decimal).collect(),
                timestamp: Utc::now(),
            });

            signals.insert(state.symbol.clone(), derive_signals(momentum, &state.history));
            model_outputs.insert(state.symbol.clone(), derive_outputs(momentum, &state.history));
        }

        FeedCycle {
            snapshots,
            signals,
            model_outputs,
        }
    }

    /// Latest price per symbol, for posting into a paper broker.
    pub fn prices(&self) -> Vec<(String, Decimal)> {
        self.symbols
            .iter()
            .map(|s| (s.symbol.clone(), to_decimal(s.price)))
            .collect()
    }
}

fn starting_price(symbol: &str) -> f64 {
    match symbol {
        "BTCUSDT" => 65_000.0,
        "ETHUSDT" => 3_200.0,
        "SOLUSDT" => 150.0,
        _ => 100.0,
    }
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(8))
        .unwrap_or(Decimal::ZERO)
}

fn realized_volatility(history: &[f64]) -> f64 {
    if history.len() < 3 {
        return 0.0;
    }
    let returns: Vec<f64> = history
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>()
        / (returns.len() - 1) as f64;
    var.sqrt()
}

/// Relative move over the whole history window.
fn momentum(history: &[f64]) -> f64 {
    let first = history.first().copied().unwrap_or(0.0);
    let last = history.last().copied().unwrap_or(0.0);
    if first <= 0.0 {
        return 0.0;
    }
    last / first - 1.0
}

fn kind_for(momentum: f64, strong_at: f64, weak_at: f64) -> SignalKind {
    if momentum > strong_at {
        SignalKind::StrongBuy
    } else if momentum > weak_at {
        SignalKind::Buy
    } else if momentum < -strong_at {
        SignalKind::StrongSell
    } else if momentum < -weak_at {
        SignalKind::Sell
    } else {
        SignalKind::Hold
    }
}

fn derive_signals(momentum_value: f64, history: &[f64]) -> Vec<SignalRecord> {
    let confidence = (momentum_value.abs() * 25.0).clamp(0.0, 0.95);
    let composite = SignalRecord::new(
        SignalSource::Composite,
        kind_for(momentum_value, 0.02, 0.005),
        confidence,
    );

    // Short-over-long moving-average crossover as the raw indicator.
    let crossover = {
        let n = history.len();
        let short = n.min(5);
        let short_ma = history[n - short..].iter().sum::<f64>() / short as f64;
        let long_ma = history.iter().sum::<f64>() / n as f64;
        if long_ma <= 0.0 {
            0.0
        } else {
            short_ma / long_ma - 1.0
        }
    };
    let indicator = SignalRecord::new(
        SignalSource::SingleIndicator,
        kind_for(crossover, 0.015, 0.003),
        (crossover.abs() * 30.0).clamp(0.0, 0.9),
    );

    vec![composite, indicator]
}

fn derive_outputs(momentum_value: f64, history: &[f64]) -> Vec<ModelOutput> {
    let trend_conf = (momentum_value.abs() * 20.0).clamp(0.0, 0.9);
    let momentum_model = ModelOutput {
        name: "momentum".to_string(),
        signal: kind_for(momentum_value, 0.02, 0.005),
        confidence: trend_conf,
        weight: 1.0,
    };

    // Mean reversion leans against the move, at lower conviction.
    let reversion_model = ModelOutput {
        name: "reversion".to_string(),
        signal: kind_for(-momentum_value, 0.03, 0.012),
        confidence: (trend_conf * 0.6).clamp(0.0, 0.7),
        weight: 0.8,
    };

    let high = history.iter().copied().fold(f64::MIN, f64::max);
    let last = history.last().copied().unwrap_or(0.0);
    let breakout_model = ModelOutput {
        name: "breakout".to_string(),
        signal: if high > 0.0 && last >= high {
            SignalKind::Buy
        } else {
            SignalKind::Hold
        },
        confidence: 0.6,
        weight: 0.9,
    };

    vec![momentum_model, reversion_model, breakout_model]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> Vec<String> {
        vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
    }

    #[test]
    fn test_cycle_covers_every_symbol() {
        let mut feed = PaperFeed::with_seed(&symbols(), 7);
        let cycle = feed.next_cycle();

        assert_eq!(cycle.snapshots.len(), 2);
        for snap in &cycle.snapshots {
            assert!(snap.price > Decimal::ZERO);
            assert!(snap.best_bid < snap.best_ask);
            assert!(cycle.signals.contains_key(&snap.symbol));
            assert_eq!(cycle.model_outputs[&snap.symbol].len(), 3);
        }
    }

    #[test]
    fn test_history_window_is_bounded() {
        let mut feed = PaperFeed::with_seed(&symbols(), 7);
        for _ in 0..50 {
            feed.next_cycle();
        }
        let cycle = feed.next_cycle();
        for snap in &cycle.snapshots {
            assert_eq!(snap.recent_prices.len(), HISTORY_LEN);
        }
    }

    #[test]
    fn test_seeded_walks_replay() {
        let mut a = PaperFeed::with_seed(&symbols(), 42);
        let mut b = PaperFeed::with_seed(&symbols(), 42);
        for _ in 0..10 {
            a.next_cycle();
            b.next_cycle();
        }
        assert_eq!(a.prices(), b.prices());
    }
}
