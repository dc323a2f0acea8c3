//! Per-tenant trading session: one isolated trading context with its own
//! balance, positions, safety state and persistence rows.
//!
//! A tick runs the full decision cycle: fold in fresh market snapshots,
//! recompute stress and regime, sweep resting orders, evaluate stops, run
//! the ensemble/arbiter/sizer pipeline per symbol, maintain take-profits,
//! then persist. A fault on one symbol never aborts the cycle for the rest.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerGateway;
use crate::config::EngineConfig;
use crate::db::{Database, SessionSnapshot};
use crate::decision::{
    EnsembleCombiner, EnsembleDecision, MarketRegime, ModelOutput, PositionSizer, SignalArbiter,
    Sizing, TradeDirective,
};
use crate::engine::execution::{BuyOutcome, ExecutionLedger, SellOutcome};
use crate::error::EngineResult;
use crate::models::{
    MarketSnapshot, Position, ReasonCode, RestingOrder, SignalKind, SignalRecord, SignalSource,
    TradeRecord, TradeSide,
};
use crate::risk::profile::{RiskProfile, RiskProfileEngine, StressLevel};
use crate::risk::safety::{Approval, SafetyController, SafetyStatus};
use crate::risk::stops::StopLossEvaluator;

/// Mutable session state shared between the session and its ledger.
#[derive(Debug)]
pub struct SessionState {
    /// Free quote balance, net of optimistic reserves
    pub balance: Decimal,

    pub realized_pnl: Decimal,

    /// Highest equity ever observed; feeds portfolio health
    pub peak_equity: Decimal,

    pub positions: HashMap<String, Position>,
    pub resting_orders: HashMap<String, RestingOrder>,

    /// Latest snapshot per symbol, for marking positions to market
    pub last_snapshots: HashMap<String, MarketSnapshot>,
}

impl SessionState {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            balance: starting_balance,
            realized_pnl: Decimal::ZERO,
            peak_equity: starting_balance,
            positions: HashMap::new(),
            resting_orders: HashMap::new(),
            last_snapshots: HashMap::new(),
        }
    }

    fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            balance: snapshot.balance,
            realized_pnl: snapshot.realized_pnl,
            peak_equity: snapshot.peak_equity,
            positions: snapshot
                .positions
                .into_iter()
                .map(|p| (p.symbol.clone(), p))
                .collect(),
            resting_orders: snapshot
                .resting_orders
                .into_iter()
                .map(|o| (o.symbol.clone(), o))
                .collect(),
            last_snapshots: HashMap::new(),
        }
    }

    /// Quote balance plus open positions marked at the latest seen price.
    /// Positions with no snapshot yet are marked at entry.
    pub fn equity(&self) -> Decimal {
        let marked: Decimal = self
            .positions
            .values()
            .map(|p| {
                let price = self
                    .last_snapshots
                    .get(&p.symbol)
                    .map(|s| s.price)
                    .unwrap_or(p.avg_price);
                p.notional(price)
            })
            .sum();
        self.balance + marked
    }

    /// Equity relative to its running peak, clamped into [0, 1].
    pub fn portfolio_health(&self) -> f64 {
        if self.peak_equity <= Decimal::ZERO {
            return 1.0;
        }
        (self.equity() / self.peak_equity)
            .to_f64()
            .unwrap_or(1.0)
            .clamp(0.0, 1.0)
    }
}

/// Point-in-time portfolio view for the CLI status command.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub session_id: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub peak_equity: Decimal,
    pub portfolio_health: f64,
    pub open_positions: usize,
    pub resting_orders: usize,
    pub risk_profile: RiskProfile,
    pub stress: f64,
    pub stress_level: StressLevel,
    pub safety: SafetyStatus,
}

pub struct TradingSession {
    id: String,
    config: Arc<EngineConfig>,
    db: Database,
    broker: Arc<dyn BrokerGateway>,
    safety: Arc<SafetyController>,
    state: Arc<Mutex<SessionState>>,
    ledger: ExecutionLedger,
    combiner: EnsembleCombiner,
    arbiter: SignalArbiter,
    sizer: PositionSizer,
    stops: StopLossEvaluator,
    risk: StdMutex<RiskProfileEngine>,
}

impl TradingSession {
    /// Open a session, restoring persisted state when present.
    ///
    /// `starting_balance` only seeds brand-new sessions; a restored session
    /// keeps its persisted balance. Resting orders that filled or died while
    /// the process was down are reconciled against the broker before the
    /// session is handed back.
    pub async fn open(
        session_id: &str,
        config: EngineConfig,
        broker: Arc<dyn BrokerGateway>,
        db: Database,
        starting_balance: Decimal,
    ) -> EngineResult<Self> {
        config.validate()?;

        let (state, safety) = match db.load_session(session_id).await? {
            Some(snapshot) => {
                info!(
                    session_id = %session_id,
                    balance = %snapshot.balance,
                    positions = snapshot.positions.len(),
                    resting_orders = snapshot.resting_orders.len(),
                    "session restored from persistence"
                );
                let safety = SafetyController::from_state(config.clone(), snapshot.safety_state.clone());
                (SessionState::from_snapshot(snapshot), safety)
            }
            None => {
                info!(session_id = %session_id, balance = %starting_balance, "new session");
                (
                    SessionState::new(starting_balance),
                    SafetyController::new(config.clone()),
                )
            }
        };

        let config = Arc::new(config);
        let safety = Arc::new(safety);
        let state = Arc::new(Mutex::new(state));
        let ledger = ExecutionLedger::new(
            session_id.to_string(),
            config.clone(),
            broker.clone(),
            db.clone(),
            safety.clone(),
            state.clone(),
        );

        let session = Self {
            id: session_id.to_string(),
            combiner: EnsembleCombiner::new(config.meta_model_path.as_deref()),
            arbiter: SignalArbiter::new((*config).clone()),
            sizer: PositionSizer::new((*config).clone()),
            stops: StopLossEvaluator::new((*config).clone()),
            config,
            db,
            broker,
            safety,
            state,
            ledger,
            risk: StdMutex::new(RiskProfileEngine::new()),
        };

        session.ledger.process_resting_fills().await?;
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run one full decision cycle over the given market snapshots.
    ///
    /// `signals` and `model_outputs` are keyed by symbol; symbols without
    /// entries simply get no directive this cycle.
    pub async fn tick(
        &self,
        snapshots: &[MarketSnapshot],
        signals: &HashMap<String, Vec<SignalRecord>>,
        model_outputs: &HashMap<String, Vec<ModelOutput>>,
    ) -> EngineResult<()> {
        // Fold the new snapshots in and ratchet position peaks.
        {
            let mut state = self.state.lock().await;
            for snap in snapshots {
                if let Some(pos) = state.positions.get_mut(&snap.symbol) {
                    pos.update_peak(snap.price);
                }
                state.last_snapshots.insert(snap.symbol.clone(), snap.clone());
            }
        }

        let (portfolio_return, drawdown) = {
            let state = self.state.lock().await;
            let equity = state.equity();
            let baseline = equity - state.realized_pnl;
            let ret = if baseline > Decimal::ZERO {
                state.realized_pnl / baseline
            } else {
                Decimal::ZERO
            };
            let dd = if state.peak_equity > Decimal::ZERO {
                (Decimal::ONE - equity / state.peak_equity).max(Decimal::ZERO)
            } else {
                Decimal::ZERO
            };
            (ret, dd)
        };
        let portfolio_volatility = if snapshots.is_empty() {
            0.0
        } else {
            snapshots.iter().map(|s| s.volatility).sum::<f64>() / snapshots.len() as f64
        };

        let regime = EnsembleCombiner::classify_regime(snapshots);
        let (stress, profile) = {
            let mut risk = self.risk.lock().unwrap();
            let stress = risk.compute_market_stress(snapshots);
            let profile = risk.adjust_profile(portfolio_return, drawdown, portfolio_volatility);
            (stress, profile)
        };
        debug!(
            session_id = %self.id,
            stress,
            profile = profile.as_str(),
            regime = regime.as_str(),
            "cycle context"
        );

        self.ledger.process_resting_fills().await?;
        self.run_stop_exits(snapshots).await;

        for snap in snapshots {
            let symbol = snap.symbol.as_str();
            let outputs = model_outputs
                .get(symbol)
                .map(|v| v.as_slice())
                .unwrap_or(&[]);
            let ensemble = self.combiner.combine(outputs, regime, snap.volatility);

            let mut cycle_signals: Vec<SignalRecord> =
                signals.get(symbol).cloned().unwrap_or_default();
            if ensemble.signal.direction() != 0 {
                cycle_signals.push(SignalRecord::new(
                    SignalSource::Ensemble,
                    ensemble.signal,
                    ensemble.confidence,
                ));
            }

            let has_position = {
                let state = self.state.lock().await;
                state.positions.contains_key(symbol)
            };
            let directive = self
                .arbiter
                .decide(&cycle_signals, &ensemble, stress, has_position);

            let result = match &directive {
                d if d.is_buy() => {
                    self.try_buy(symbol, snap, d, &ensemble, profile, regime, stress)
                        .await
                }
                d if d.is_sell() => self.try_sell(symbol, d, &ensemble).await,
                TradeDirective::Hold { reason } => {
                    debug!(symbol = %symbol, reason = %reason, "holding");
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                error!(symbol = %symbol, error = %e, "symbol cycle failed");
            }
        }

        self.maintain_take_profits().await;

        {
            let mut state = self.state.lock().await;
            let equity = state.equity();
            if equity > state.peak_equity {
                state.peak_equity = equity;
            }
        }

        self.save_state().await
    }

    /// Evaluate stop rules for every open position and exit on breach.
    async fn run_stop_exits(&self, snapshots: &[MarketSnapshot]) {
        let open: Vec<Position> = {
            let state = self.state.lock().await;
            state.positions.values().cloned().collect()
        };

        for pos in open {
            let Some(snap) = snapshots.iter().find(|s| s.symbol == pos.symbol) else {
                continue;
            };
            let Some(trigger) = self.stops.evaluate(&pos, snap, None) else {
                continue;
            };
            info!(
                symbol = %pos.symbol,
                code = trigger.code.as_str(),
                trigger = %trigger.trigger_price,
                price = %snap.price,
                "stop exit"
            );
            match self
                .ledger
                .execute_sell(&pos.symbol, trigger.code, None, pos.signal_strength)
                .await
            {
                Ok(SellOutcome::Executed { pnl }) => {
                    info!(symbol = %pos.symbol, pnl = %pnl, "stop exit filled");
                }
                Ok(SellOutcome::Skipped { code, detail }) => {
                    warn!(symbol = %pos.symbol, code = code.as_str(), detail = %detail, "stop exit skipped");
                }
                Err(e) => {
                    error!(symbol = %pos.symbol, error = %e, "stop exit failed");
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_buy(
        &self,
        symbol: &str,
        snapshot: &MarketSnapshot,
        directive: &TradeDirective,
        ensemble: &EnsembleDecision,
        profile: RiskProfile,
        regime: MarketRegime,
        stress: f64,
    ) -> EngineResult<()> {
        let (balance, position_notional, health) = {
            let state = self.state.lock().await;
            let notional = state
                .positions
                .get(symbol)
                .map(|p| p.notional(snapshot.price))
                .unwrap_or(Decimal::ZERO);
            (state.balance, notional, state.portfolio_health())
        };

        let notional = match self.sizer.size_buy(
            directive,
            balance,
            snapshot.price,
            ensemble.confidence,
            profile,
            regime,
            snapshot.volatility,
            health,
            stress,
        ) {
            Sizing::Order { notional, .. } => notional,
            Sizing::Rejected { reason } => {
                info!(symbol = %symbol, reason = %reason, "sizing rejected buy");
                let record = TradeRecord::rejection(
                    symbol,
                    TradeSide::Buy,
                    self.config.execution_mode,
                    ReasonCode::SizingRejected,
                    &reason,
                );
                self.db.record_trade(&self.id, &record).await?;
                return Ok(());
            }
        };

        match self.safety.approve_trade(
            symbol,
            notional,
            balance,
            position_notional,
            snapshot.volatility,
            stress,
            health,
            None,
        ) {
            Approval::Approved => {}
            Approval::Rejected { code, detail } => {
                info!(symbol = %symbol, code = code.as_str(), detail = %detail, "safety rejected buy");
                let record = TradeRecord::rejection(
                    symbol,
                    TradeSide::Buy,
                    self.config.execution_mode,
                    code,
                    &detail,
                );
                self.db.record_trade(&self.id, &record).await?;
                return Ok(());
            }
        }

        let kind = if directive.is_strong() {
            SignalKind::StrongBuy
        } else {
            SignalKind::Buy
        };
        match self
            .ledger
            .execute_buy(symbol, notional, kind, ensemble.confidence)
            .await?
        {
            BuyOutcome::Executed { quantity, notional } => {
                info!(symbol = %symbol, quantity = %quantity, notional = %notional, "position opened or extended");
                self.ledger.sync_take_profit(symbol).await?;
            }
            BuyOutcome::Skipped { code, detail } => {
                warn!(symbol = %symbol, code = code.as_str(), detail = %detail, "buy skipped");
            }
        }
        Ok(())
    }

    async fn try_sell(
        &self,
        symbol: &str,
        directive: &TradeDirective,
        ensemble: &EnsembleDecision,
    ) -> EngineResult<()> {
        let kind = if directive.is_strong() {
            SignalKind::StrongSell
        } else {
            SignalKind::Sell
        };
        match self
            .ledger
            .execute_sell(symbol, ReasonCode::Filled, Some(kind), ensemble.confidence)
            .await?
        {
            SellOutcome::Executed { pnl } => {
                info!(symbol = %symbol, pnl = %pnl, "signal exit filled");
            }
            SellOutcome::Skipped { code, detail } => {
                warn!(symbol = %symbol, code = code.as_str(), detail = %detail, "signal exit skipped");
            }
        }
        Ok(())
    }

    /// Sync the resting take-profit for every symbol that has a position or
    /// a resting order; the union catches orphaned orders too.
    async fn maintain_take_profits(&self) {
        let symbols: Vec<String> = {
            let state = self.state.lock().await;
            state
                .positions
                .keys()
                .chain(state.resting_orders.keys())
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };
        for symbol in symbols {
            if let Err(e) = self.ledger.sync_take_profit(&symbol).await {
                error!(symbol = %symbol, error = %e, "take-profit maintenance failed");
            }
        }
    }

    /// Halt trading, cancel every resting order and market-sell every open
    /// position. Trading stays disabled until an operator resume.
    pub async fn emergency_stop(&self, reason: &str) -> EngineResult<()> {
        warn!(session_id = %self.id, reason = %reason, "emergency stop");
        self.safety.disable_trading(reason);
        self.safety.trigger_global_breaker(reason, None);

        let resting: Vec<RestingOrder> = {
            let mut state = self.state.lock().await;
            state.resting_orders.drain().map(|(_, o)| o).collect()
        };
        for order in resting {
            if let Err(e) = self.broker.cancel_order(&order.symbol, &order.order_id).await {
                warn!(
                    symbol = %order.symbol,
                    order_id = %order.order_id,
                    error = %e,
                    "cancel during emergency stop failed"
                );
            }
        }

        let symbols: Vec<String> = {
            let state = self.state.lock().await;
            state.positions.keys().cloned().collect()
        };
        for symbol in symbols {
            match self
                .ledger
                .execute_sell(&symbol, ReasonCode::EmergencyLiquidation, None, 0.0)
                .await
            {
                Ok(SellOutcome::Executed { pnl }) => {
                    info!(symbol = %symbol, pnl = %pnl, "position liquidated");
                }
                Ok(SellOutcome::Skipped { code, detail }) => {
                    warn!(symbol = %symbol, code = code.as_str(), detail = %detail, "liquidation skipped");
                }
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "liquidation failed");
                }
            }
        }

        self.save_state().await
    }

    /// Operator halt without liquidation.
    pub async fn halt(&self, reason: &str) -> EngineResult<()> {
        self.safety.disable_trading(reason);
        self.save_state().await
    }

    /// Operator resume after a halt or a tripped global breaker.
    pub async fn resume(&self) -> EngineResult<()> {
        self.safety.enable_trading();
        self.save_state().await
    }

    pub fn safety_status(&self) -> SafetyStatus {
        self.safety.status(None)
    }

    pub async fn summary(&self) -> PortfolioSummary {
        let state = self.state.lock().await;
        let equity = state.equity();
        let unrealized_pnl: Decimal = state
            .positions
            .values()
            .map(|p| {
                let price = state
                    .last_snapshots
                    .get(&p.symbol)
                    .map(|s| s.price)
                    .unwrap_or(p.avg_price);
                p.unrealized_pnl(price)
            })
            .sum();
        let (risk_profile, stress, stress_level) = {
            let risk = self.risk.lock().unwrap();
            (risk.profile(), risk.stress(), risk.stress_level())
        };

        PortfolioSummary {
            session_id: self.id.clone(),
            balance: state.balance,
            equity,
            realized_pnl: state.realized_pnl,
            unrealized_pnl,
            peak_equity: state.peak_equity,
            portfolio_health: state.portfolio_health(),
            open_positions: state.positions.len(),
            resting_orders: state.resting_orders.len(),
            risk_profile,
            stress,
            stress_level,
            safety: self.safety.status(None),
        }
    }

    /// Persist the full session snapshot.
    pub async fn save_state(&self) -> EngineResult<()> {
        let snapshot = {
            let state = self.state.lock().await;
            SessionSnapshot {
                balance: state.balance,
                realized_pnl: state.realized_pnl,
                peak_equity: state.peak_equity,
                safety_state: self.safety.snapshot_state(),
                positions: state.positions.values().cloned().collect(),
                resting_orders: state.resting_orders.values().cloned().collect(),
            }
        };
        self.db.save_session(&self.id, &snapshot).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn make_snapshot(symbol: &str, price: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            price,
            best_bid: price * dec!(0.9995),
            best_ask: price * dec!(1.0005),
            volume_24h: dec!(1000000),
            prev_volume_24h: dec!(1000000),
            volatility: 0.02,
            recent_prices: vec![price; 5],
            timestamp: Utc::now(),
        }
    }

    fn buy_signals() -> Vec<SignalRecord> {
        vec![
            SignalRecord::new(SignalSource::Composite, SignalKind::StrongBuy, 0.9),
            SignalRecord::new(SignalSource::Model, SignalKind::Buy, 0.8),
        ]
    }

    fn buy_outputs() -> Vec<ModelOutput> {
        ["momentum", "reversion", "breakout"]
            .iter()
            .map(|name| ModelOutput {
                name: name.to_string(),
                signal: SignalKind::Buy,
                confidence: 0.9,
                weight: 1.0,
            })
            .collect()
    }

    async fn open_session(broker: Arc<PaperBroker>, db: Database) -> TradingSession {
        TradingSession::open("test", EngineConfig::default(), broker, db, dec!(1000))
            .await
            .unwrap()
    }

    async fn run_buy_tick(session: &TradingSession) {
        let snapshots = vec![make_snapshot("BTCUSDT", dec!(100))];
        let signals = HashMap::from([("BTCUSDT".to_string(), buy_signals())]);
        let outputs = HashMap::from([("BTCUSDT".to_string(), buy_outputs())]);
        session.tick(&snapshots, &signals, &outputs).await.unwrap();
    }

    #[tokio::test]
    async fn test_buy_cycle_opens_position_with_take_profit() {
        let broker = Arc::new(PaperBroker::new(dec!(1000)));
        broker.set_price("BTCUSDT", dec!(100)).await;
        let db = Database::in_memory().await.unwrap();
        let session = open_session(broker.clone(), db).await;

        run_buy_tick(&session).await;

        let state = session.state.lock().await;
        let pos = state.positions.get("BTCUSDT").expect("position opened");
        assert!(pos.quantity > Decimal::ZERO);
        assert_eq!(pos.avg_price, dec!(100));
        assert!(state.resting_orders.contains_key("BTCUSDT"));
        assert!(state.balance < dec!(1000));
    }

    #[tokio::test]
    async fn test_stop_exit_closes_position() {
        let broker = Arc::new(PaperBroker::new(dec!(1000)));
        broker.set_price("BTCUSDT", dec!(100)).await;
        let db = Database::in_memory().await.unwrap();
        let session = open_session(broker.clone(), db).await;
        run_buy_tick(&session).await;

        // Crash through the fixed stop.
        broker.set_price("BTCUSDT", dec!(90)).await;
        let crashed = vec![make_snapshot("BTCUSDT", dec!(90))];
        session
            .tick(&crashed, &HashMap::new(), &HashMap::new())
            .await
            .unwrap();

        let state = session.state.lock().await;
        assert!(state.positions.is_empty());
        assert!(state.resting_orders.is_empty());
        assert!(state.realized_pnl < Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_emergency_stop_liquidates_and_halts() {
        let broker = Arc::new(PaperBroker::new(dec!(1000)));
        broker.set_price("BTCUSDT", dec!(100)).await;
        let db = Database::in_memory().await.unwrap();
        let session = open_session(broker.clone(), db).await;
        run_buy_tick(&session).await;

        session.emergency_stop("operator panic").await.unwrap();

        let state = session.state.lock().await;
        assert!(state.positions.is_empty());
        assert!(state.resting_orders.is_empty());
        drop(state);

        let status = session.safety_status();
        assert!(!status.trading_enabled);
        assert!(status.global_breaker_active);

        // Resume clears the halt and the breaker.
        session.resume().await.unwrap();
        let status = session.safety_status();
        assert!(status.trading_enabled);
        assert!(!status.global_breaker_active);
    }

    #[tokio::test]
    async fn test_session_restores_after_restart() {
        let broker = Arc::new(PaperBroker::new(dec!(1000)));
        broker.set_price("BTCUSDT", dec!(100)).await;
        let db = Database::in_memory().await.unwrap();

        let session =
            TradingSession::open("s1", EngineConfig::default(), broker.clone(), db.clone(), dec!(1000))
                .await
                .unwrap();
        run_buy_tick(&session).await;
        let balance_before = session.state.lock().await.balance;
        drop(session);

        // Reopen against the same database; the persisted balance wins over
        // the starting-balance argument.
        let restored =
            TradingSession::open("s1", EngineConfig::default(), broker, db, Decimal::ZERO)
                .await
                .unwrap();
        let state = restored.state.lock().await;
        assert_eq!(state.balance, balance_before);
        assert!(state.positions.contains_key("BTCUSDT"));
        assert!(state.resting_orders.contains_key("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_tenants_sharing_a_database_stay_isolated() {
        let db = Database::in_memory().await.unwrap();

        let broker_a = Arc::new(PaperBroker::new(dec!(1000)));
        broker_a.set_price("BTCUSDT", dec!(100)).await;
        let session_a =
            TradingSession::open("s1", EngineConfig::default(), broker_a, db.clone(), dec!(1000))
                .await
                .unwrap();

        let broker_b = Arc::new(PaperBroker::new(dec!(1000)));
        broker_b.set_price("BTCUSDT", dec!(100)).await;
        let session_b =
            TradingSession::open("s2", EngineConfig::default(), broker_b, db.clone(), dec!(1000))
                .await
                .unwrap();

        run_buy_tick(&session_a).await;

        let summary_b = session_b.summary().await;
        assert_eq!(summary_b.balance, dec!(1000));
        assert_eq!(summary_b.open_positions, 0);

        session_a.save_state().await.unwrap();
        session_b.save_state().await.unwrap();

        let snap_a = db.load_session("s1").await.unwrap().unwrap();
        let snap_b = db.load_session("s2").await.unwrap().unwrap();
        assert!(!snap_a.positions.is_empty());
        assert!(snap_b.positions.is_empty());
        assert_eq!(snap_b.balance, dec!(1000));

        assert!(!db.recent_trades("s1", 10).await.unwrap().is_empty());
        assert!(db.recent_trades("s2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hold_cycle_changes_nothing() {
        let broker = Arc::new(PaperBroker::new(dec!(1000)));
        broker.set_price("BTCUSDT", dec!(100)).await;
        let db = Database::in_memory().await.unwrap();
        let session = open_session(broker, db).await;

        let snapshots = vec![make_snapshot("BTCUSDT", dec!(100))];
        session
            .tick(&snapshots, &HashMap::new(), &HashMap::new())
            .await
            .unwrap();

        let summary = session.summary().await;
        assert_eq!(summary.balance, dec!(1000));
        assert_eq!(summary.open_positions, 0);
        assert_eq!(summary.realized_pnl, Decimal::ZERO);
    }
}
