//! Append-only trade journal records.
//!
//! Every order attempt, accepted or rejected, produces exactly one
//! `TradeRecord`. Rejections carry the reason code of the first rule that
//! denied them, so the journal doubles as an audit trail for the safety
//! controller and the arbiter.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SignalKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl std::str::FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(format!("unknown trade side: {other}")),
        }
    }
}

/// Paper or real execution. Journaled on every record so mixed histories
/// stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Paper,
    Real,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Paper => "paper",
            ExecutionMode::Real => "real",
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paper" => Ok(ExecutionMode::Paper),
            "real" => Ok(ExecutionMode::Real),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// Why a record exists: what filled, what stopped, or what blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    // Fills
    Filled,
    TakeProfit,

    // Stop triggers
    StopFixed,
    StopAtr,
    StopTrailing,
    StopTime,
    StopVolatility,
    EmergencyLiquidation,

    // Safety rejections
    GlobalBreaker,
    SymbolBreaker,
    PositionCap,
    DailyLossLimit,
    LossStreak,
    VolatilityStress,
    PortfolioHealth,
    ApiFailures,

    // Execution skips and faults
    BelowMinNotional,
    InsufficientExchangeBalance,
    BrokerRejected,
    BrokerAmbiguous,
    ReconciliationDrift,
    SizingRejected,

    // Arbiter produced no directive
    Hold,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Filled => "filled",
            ReasonCode::TakeProfit => "take_profit",
            ReasonCode::StopFixed => "stop_fixed",
            ReasonCode::StopAtr => "stop_atr",
            ReasonCode::StopTrailing => "stop_trailing",
            ReasonCode::StopTime => "stop_time",
            ReasonCode::StopVolatility => "stop_volatility",
            ReasonCode::EmergencyLiquidation => "emergency_liquidation",
            ReasonCode::GlobalBreaker => "global_breaker",
            ReasonCode::SymbolBreaker => "symbol_breaker",
            ReasonCode::PositionCap => "position_cap",
            ReasonCode::DailyLossLimit => "daily_loss_limit",
            ReasonCode::LossStreak => "loss_streak",
            ReasonCode::VolatilityStress => "volatility_stress",
            ReasonCode::PortfolioHealth => "portfolio_health",
            ReasonCode::ApiFailures => "api_failures",
            ReasonCode::BelowMinNotional => "below_min_notional",
            ReasonCode::InsufficientExchangeBalance => "insufficient_exchange_balance",
            ReasonCode::BrokerRejected => "broker_rejected",
            ReasonCode::BrokerAmbiguous => "broker_ambiguous",
            ReasonCode::ReconciliationDrift => "reconciliation_drift",
            ReasonCode::SizingRejected => "sizing_rejected",
            ReasonCode::Hold => "hold",
        }
    }

    /// True for codes describing a completed fill rather than a rejection.
    pub fn is_fill(&self) -> bool {
        matches!(
            self,
            ReasonCode::Filled
                | ReasonCode::TakeProfit
                | ReasonCode::StopFixed
                | ReasonCode::StopAtr
                | ReasonCode::StopTrailing
                | ReasonCode::StopTime
                | ReasonCode::StopVolatility
                | ReasonCode::EmergencyLiquidation
        )
    }
}

impl std::str::FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filled" => Ok(ReasonCode::Filled),
            "take_profit" => Ok(ReasonCode::TakeProfit),
            "stop_fixed" => Ok(ReasonCode::StopFixed),
            "stop_atr" => Ok(ReasonCode::StopAtr),
            "stop_trailing" => Ok(ReasonCode::StopTrailing),
            "stop_time" => Ok(ReasonCode::StopTime),
            "stop_volatility" => Ok(ReasonCode::StopVolatility),
            "emergency_liquidation" => Ok(ReasonCode::EmergencyLiquidation),
            "global_breaker" => Ok(ReasonCode::GlobalBreaker),
            "symbol_breaker" => Ok(ReasonCode::SymbolBreaker),
            "position_cap" => Ok(ReasonCode::PositionCap),
            "daily_loss_limit" => Ok(ReasonCode::DailyLossLimit),
            "loss_streak" => Ok(ReasonCode::LossStreak),
            "volatility_stress" => Ok(ReasonCode::VolatilityStress),
            "portfolio_health" => Ok(ReasonCode::PortfolioHealth),
            "api_failures" => Ok(ReasonCode::ApiFailures),
            "below_min_notional" => Ok(ReasonCode::BelowMinNotional),
            "insufficient_exchange_balance" => Ok(ReasonCode::InsufficientExchangeBalance),
            "broker_rejected" => Ok(ReasonCode::BrokerRejected),
            "broker_ambiguous" => Ok(ReasonCode::BrokerAmbiguous),
            "reconciliation_drift" => Ok(ReasonCode::ReconciliationDrift),
            "sizing_rejected" => Ok(ReasonCode::SizingRejected),
            "hold" => Ok(ReasonCode::Hold),
            other => Err(format!("unknown reason code: {other}")),
        }
    }
}

/// One journal row. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub notional: Decimal,

    /// Realized P&L for sells; zero for buys and rejections
    pub pnl: Decimal,
    pub pnl_percent: Decimal,

    /// Signal that drove the attempt, if any
    pub signal: Option<SignalKind>,
    pub confidence: f64,

    pub execution_mode: ExecutionMode,

    /// Broker-assigned id for fills; absent for rejections
    pub broker_order_id: Option<String>,
    pub commission: Decimal,

    pub reason_code: ReasonCode,

    /// Free-form detail (rejection rule output, drift description)
    pub detail: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl TradeRecord {
    /// Record for an executed (possibly partial) fill.
    #[allow(clippy::too_many_arguments)]
    pub fn fill(
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
        price: Decimal,
        pnl: Decimal,
        signal: Option<SignalKind>,
        confidence: f64,
        execution_mode: ExecutionMode,
        broker_order_id: String,
        commission: Decimal,
        reason_code: ReasonCode,
    ) -> Self {
        let notional = quantity * price;
        let pnl_percent = if notional.is_zero() {
            Decimal::ZERO
        } else {
            pnl / notional
        };
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            notional,
            pnl,
            pnl_percent,
            signal,
            confidence,
            execution_mode,
            broker_order_id: Some(broker_order_id),
            commission,
            reason_code,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    /// Record for an attempt that was blocked or skipped before filling.
    pub fn rejection(
        symbol: &str,
        side: TradeSide,
        execution_mode: ExecutionMode,
        reason_code: ReasonCode,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            quantity: Decimal::ZERO,
            price: Decimal::ZERO,
            notional: Decimal::ZERO,
            pnl: Decimal::ZERO,
            pnl_percent: Decimal::ZERO,
            signal: None,
            confidence: 0.0,
            execution_mode,
            broker_order_id: None,
            commission: Decimal::ZERO,
            reason_code,
            detail: Some(detail.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
