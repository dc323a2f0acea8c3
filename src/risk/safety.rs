//! Safety controller: the ordered gate every buy attempt passes through.
//!
//! Rules are checked in a fixed order and the first breach wins, so a
//! rejection always carries the single highest-severity reason. Breakers
//! latch until their cooldown expires; nothing un-trips early except an
//! operator re-enable.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::models::ReasonCode;

/// Outcome of a safety check. Rejections are normal control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    Approved,
    Rejected { code: ReasonCode, detail: String },
}

impl Approval {
    pub fn is_approved(&self) -> bool {
        matches!(self, Approval::Approved)
    }

    fn rejected(code: ReasonCode, detail: impl Into<String>) -> Self {
        Approval::Rejected {
            code,
            detail: detail.into(),
        }
    }
}

/// Scope of a tripped breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerScope {
    Global,
    Symbol(String),
}

/// A latched halt with a release time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub scope: BreakerScope,
    pub reason: String,
    pub activated_at: DateTime<Utc>,
    pub release_at: DateTime<Utc>,
}

impl CircuitBreaker {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.release_at
    }
}

/// Serializable snapshot of the controller's internal state, persisted
/// across restarts so breakers survive a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyState {
    pub trading_enabled: bool,
    pub disabled_reason: Option<String>,
    pub global_breaker: Option<CircuitBreaker>,
    pub symbol_breakers: HashMap<String, CircuitBreaker>,
    pub daily_pnl: Decimal,
    pub loss_streaks: HashMap<String, u32>,
    pub api_failure_count: u32,
    pub day: NaiveDate,
    pub start_of_day_balance: Decimal,
}

impl SafetyState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            trading_enabled: true,
            disabled_reason: None,
            global_breaker: None,
            symbol_breakers: HashMap::new(),
            daily_pnl: Decimal::ZERO,
            loss_streaks: HashMap::new(),
            api_failure_count: 0,
            day: now.date_naive(),
            start_of_day_balance: Decimal::ZERO,
        }
    }
}

/// Read-only status view for the CLI and the session summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub trading_enabled: bool,
    pub disabled_reason: Option<String>,
    pub global_breaker_active: bool,
    pub active_symbol_breakers: Vec<String>,
    pub daily_pnl: Decimal,
    pub api_failure_count: u32,
}

/// All mutation happens behind one std mutex; no lock is ever held across
/// an await point.
pub struct SafetyController {
    config: EngineConfig,
    state: Mutex<SafetyState>,
}

impl SafetyController {
    pub fn new(config: EngineConfig) -> Self {
        let state = Mutex::new(SafetyState::new(Utc::now()));
        Self { config, state }
    }

    pub fn from_state(config: EngineConfig, state: SafetyState) -> Self {
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn snapshot_state(&self) -> SafetyState {
        self.state.lock().unwrap().clone()
    }

    /// Run the full rejection cascade for a proposed buy.
    ///
    /// `reference_time` pins "now" for deterministic tests; production
    /// callers pass `None`.
    #[allow(clippy::too_many_arguments)]
    pub fn approve_trade(
        &self,
        symbol: &str,
        notional: Decimal,
        balance: Decimal,
        current_position_notional: Decimal,
        volatility: f64,
        stress: f64,
        portfolio_health: f64,
        reference_time: Option<DateTime<Utc>>,
    ) -> Approval {
        let now = reference_time.unwrap_or_else(Utc::now);
        let mut state = self.state.lock().unwrap();

        self.roll_day_if_needed(&mut state, now, balance);

        if !state.trading_enabled {
            let detail = state
                .disabled_reason
                .clone()
                .unwrap_or_else(|| "trading disabled".to_string());
            return Approval::rejected(ReasonCode::GlobalBreaker, detail);
        }

        if let Some(breaker) = &state.global_breaker {
            if breaker.is_active(now) {
                return Approval::rejected(
                    ReasonCode::GlobalBreaker,
                    format!("global breaker until {}: {}", breaker.release_at, breaker.reason),
                );
            }
            state.global_breaker = None;
            info!("global breaker cooldown expired, trading resumes");
        }

        if let Some(breaker) = state.symbol_breakers.get(symbol) {
            if breaker.is_active(now) {
                return Approval::rejected(
                    ReasonCode::SymbolBreaker,
                    format!("{symbol} breaker until {}: {}", breaker.release_at, breaker.reason),
                );
            }
            state.symbol_breakers.remove(symbol);
            state.loss_streaks.remove(symbol);
            info!(symbol = %symbol, "symbol breaker cooldown expired");
        }

        let position_cap = balance * self.config.max_position_fraction;
        if current_position_notional + notional > position_cap {
            return Approval::rejected(
                ReasonCode::PositionCap,
                format!(
                    "position {} + order {} exceeds cap {}",
                    current_position_notional, notional, position_cap
                ),
            );
        }

        let loss_ceiling = state.start_of_day_balance * self.config.max_daily_loss_fraction;
        if state.daily_pnl < Decimal::ZERO && -state.daily_pnl >= loss_ceiling && !loss_ceiling.is_zero() {
            return Approval::rejected(
                ReasonCode::DailyLossLimit,
                format!("daily loss {} >= ceiling {}", -state.daily_pnl, loss_ceiling),
            );
        }

        let streak = state.loss_streaks.get(symbol).copied().unwrap_or(0);
        if streak >= self.config.loss_streak_limit {
            let breaker = CircuitBreaker {
                scope: BreakerScope::Symbol(symbol.to_string()),
                reason: format!("{streak} consecutive losses"),
                activated_at: now,
                release_at: now + Duration::seconds(self.config.symbol_breaker_cooldown_secs),
            };
            warn!(symbol = %symbol, streak, "loss streak tripped symbol breaker");
            state.symbol_breakers.insert(symbol.to_string(), breaker);
            return Approval::rejected(
                ReasonCode::LossStreak,
                format!("{streak} consecutive losses on {symbol}"),
            );
        }

        if volatility > self.config.volatility_threshold && stress > 0.6 {
            return Approval::rejected(
                ReasonCode::VolatilityStress,
                format!("volatility {volatility:.4} with stress {stress:.2}"),
            );
        }

        if portfolio_health < 0.5 {
            return Approval::rejected(
                ReasonCode::PortfolioHealth,
                format!("portfolio health {portfolio_health:.2} below 0.50"),
            );
        }

        if state.api_failure_count >= self.config.api_failure_limit {
            return Approval::rejected(
                ReasonCode::ApiFailures,
                format!("{} consecutive broker failures", state.api_failure_count),
            );
        }

        Approval::Approved
    }

    /// Record a realized trade result, feeding the daily P&L and the
    /// per-symbol loss streak.
    pub fn register_result(&self, symbol: &str, pnl: Decimal, reference_time: Option<DateTime<Utc>>) {
        let now = reference_time.unwrap_or_else(Utc::now);
        let mut state = self.state.lock().unwrap();

        if state.day != now.date_naive() {
            // Result for a new day; the next approval sets the new baseline.
            state.day = now.date_naive();
            state.daily_pnl = Decimal::ZERO;
        }

        state.daily_pnl += pnl;

        if pnl < Decimal::ZERO {
            let streak = state.loss_streaks.entry(symbol.to_string()).or_insert(0);
            *streak += 1;
            info!(symbol = %symbol, streak = *streak, pnl = %pnl, "loss recorded");
        } else if pnl > Decimal::ZERO {
            state.loss_streaks.remove(symbol);
        }
    }

    /// Trip the global breaker immediately.
    pub fn trigger_global_breaker(&self, reason: &str, reference_time: Option<DateTime<Utc>>) {
        let now = reference_time.unwrap_or_else(Utc::now);
        let mut state = self.state.lock().unwrap();
        warn!(reason = %reason, "global circuit breaker tripped");
        state.global_breaker = Some(CircuitBreaker {
            scope: BreakerScope::Global,
            reason: reason.to_string(),
            activated_at: now,
            release_at: now + Duration::seconds(self.config.global_breaker_cooldown_secs),
        });
    }

    pub fn record_api_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.api_failure_count += 1;
        if state.api_failure_count >= self.config.api_failure_limit {
            warn!(
                count = state.api_failure_count,
                "broker failure tripwire reached, approvals blocked"
            );
        }
    }

    pub fn record_api_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.api_failure_count = 0;
    }

    /// Operator halt. Stays off until `enable_trading`.
    pub fn disable_trading(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        warn!(reason = %reason, "trading disabled by operator");
        state.trading_enabled = false;
        state.disabled_reason = Some(reason.to_string());
    }

    /// Operator resume. Also clears the global breaker.
    pub fn enable_trading(&self) {
        let mut state = self.state.lock().unwrap();
        info!("trading re-enabled by operator");
        state.trading_enabled = true;
        state.disabled_reason = None;
        state.global_breaker = None;
    }

    pub fn status(&self, reference_time: Option<DateTime<Utc>>) -> SafetyStatus {
        let now = reference_time.unwrap_or_else(Utc::now);
        let state = self.state.lock().unwrap();
        SafetyStatus {
            trading_enabled: state.trading_enabled,
            disabled_reason: state.disabled_reason.clone(),
            global_breaker_active: state
                .global_breaker
                .as_ref()
                .map(|b| b.is_active(now))
                .unwrap_or(false),
            active_symbol_breakers: state
                .symbol_breakers
                .iter()
                .filter(|(_, b)| b.is_active(now))
                .map(|(s, _)| s.clone())
                .collect(),
            daily_pnl: state.daily_pnl,
            api_failure_count: state.api_failure_count,
        }
    }

    fn roll_day_if_needed(&self, state: &mut SafetyState, now: DateTime<Utc>, balance: Decimal) {
        if state.day != now.date_naive() {
            info!(
                previous_day = %state.day,
                daily_pnl = %state.daily_pnl,
                "UTC day rollover, daily counters reset"
            );
            state.day = now.date_naive();
            state.daily_pnl = Decimal::ZERO;
            state.start_of_day_balance = balance;
        }
        if state.start_of_day_balance.is_zero() {
            state.start_of_day_balance = balance;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_controller() -> SafetyController {
        SafetyController::new(EngineConfig::default())
    }

    fn approve(ctl: &SafetyController, symbol: &str) -> Approval {
        ctl.approve_trade(
            symbol,
            dec!(50),
            dec!(1000),
            Decimal::ZERO,
            0.01,
            0.1,
            1.0,
            None,
        )
    }

    #[test]
    fn test_clean_state_approves() {
        let ctl = make_controller();
        assert!(approve(&ctl, "BTCUSDT").is_approved());
    }

    #[test]
    fn test_position_cap_rejects() {
        let ctl = make_controller();
        // Cap is 20% of 1000 = 200; existing 150 + order 100 breaches it.
        let approval = ctl.approve_trade(
            "BTCUSDT",
            dec!(100),
            dec!(1000),
            dec!(150),
            0.01,
            0.1,
            1.0,
            None,
        );
        match approval {
            Approval::Rejected { code, .. } => assert_eq!(code, ReasonCode::PositionCap),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_daily_loss_ceiling_blocks() {
        let ctl = make_controller();
        // Seed the start-of-day baseline.
        assert!(approve(&ctl, "BTCUSDT").is_approved());
        // 3% of 1000 = 30; lose 35.
        ctl.register_result("BTCUSDT", dec!(-35), None);

        let approval = approve(&ctl, "ETHUSDT");
        match approval {
            Approval::Rejected { code, .. } => assert_eq!(code, ReasonCode::DailyLossLimit),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_loss_streak_trips_symbol_breaker_only() {
        let ctl = make_controller();
        assert!(approve(&ctl, "BTCUSDT").is_approved());
        for _ in 0..3 {
            ctl.register_result("BTCUSDT", dec!(-1), None);
        }

        let approval = approve(&ctl, "BTCUSDT");
        match approval {
            Approval::Rejected { code, .. } => assert_eq!(code, ReasonCode::LossStreak),
            other => panic!("expected rejection, got {other:?}"),
        }
        // Now latched as a breaker for subsequent attempts.
        let approval = approve(&ctl, "BTCUSDT");
        match approval {
            Approval::Rejected { code, .. } => assert_eq!(code, ReasonCode::SymbolBreaker),
            other => panic!("expected rejection, got {other:?}"),
        }
        // Other symbols unaffected.
        assert!(approve(&ctl, "ETHUSDT").is_approved());
    }

    #[test]
    fn test_win_resets_streak() {
        let ctl = make_controller();
        ctl.register_result("BTCUSDT", dec!(-1), None);
        ctl.register_result("BTCUSDT", dec!(-1), None);
        ctl.register_result("BTCUSDT", dec!(2), None);
        ctl.register_result("BTCUSDT", dec!(-1), None);
        // Streak is 1, below the limit of 3.
        assert!(approve(&ctl, "BTCUSDT").is_approved());
    }

    #[test]
    fn test_symbol_breaker_releases_after_cooldown() {
        let ctl = make_controller();
        let t0 = Utc::now();
        assert!(approve(&ctl, "BTCUSDT").is_approved());
        for _ in 0..3 {
            ctl.register_result("BTCUSDT", dec!(-1), Some(t0));
        }
        // Trip the breaker.
        let _ = ctl.approve_trade(
            "BTCUSDT", dec!(50), dec!(1000), Decimal::ZERO, 0.01, 0.1, 1.0, Some(t0),
        );

        // 31 minutes later the cooldown (30 min) has expired and the streak
        // was cleared along with the breaker.
        let later = t0 + Duration::seconds(31 * 60);
        let approval = ctl.approve_trade(
            "BTCUSDT", dec!(50), dec!(1000), Decimal::ZERO, 0.01, 0.1, 1.0, Some(later),
        );
        assert!(approval.is_approved());
    }

    #[test]
    fn test_global_breaker_blocks_everything() {
        let ctl = make_controller();
        ctl.trigger_global_breaker("3 broker failures in one cycle", None);

        for symbol in ["BTCUSDT", "ETHUSDT"] {
            match approve(&ctl, symbol) {
                Approval::Rejected { code, .. } => assert_eq!(code, ReasonCode::GlobalBreaker),
                other => panic!("expected rejection, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_volatility_needs_elevated_stress() {
        let ctl = make_controller();
        // High volatility alone passes.
        let approval = ctl.approve_trade(
            "BTCUSDT", dec!(50), dec!(1000), Decimal::ZERO, 0.08, 0.2, 1.0, None,
        );
        assert!(approval.is_approved());

        // High volatility plus stress rejects.
        let approval = ctl.approve_trade(
            "BTCUSDT", dec!(50), dec!(1000), Decimal::ZERO, 0.08, 0.7, 1.0, None,
        );
        match approval {
            Approval::Rejected { code, .. } => assert_eq!(code, ReasonCode::VolatilityStress),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_api_tripwire() {
        let ctl = make_controller();
        for _ in 0..5 {
            ctl.record_api_failure();
        }
        match approve(&ctl, "BTCUSDT") {
            Approval::Rejected { code, .. } => assert_eq!(code, ReasonCode::ApiFailures),
            other => panic!("expected rejection, got {other:?}"),
        }
        ctl.record_api_success();
        assert!(approve(&ctl, "BTCUSDT").is_approved());
    }

    #[test]
    fn test_day_rollover_resets_counters() {
        let ctl = make_controller();
        let t0 = Utc::now();
        let _ = ctl.approve_trade(
            "BTCUSDT", dec!(50), dec!(1000), Decimal::ZERO, 0.01, 0.1, 1.0, Some(t0),
        );
        ctl.register_result("BTCUSDT", dec!(-35), Some(t0));

        let next_day = t0 + Duration::days(1);
        let approval = ctl.approve_trade(
            "BTCUSDT", dec!(50), dec!(900), Decimal::ZERO, 0.01, 0.1, 1.0, Some(next_day),
        );
        assert!(approval.is_approved());
        assert_eq!(ctl.status(Some(next_day)).daily_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_operator_halt_and_resume() {
        let ctl = make_controller();
        ctl.disable_trading("manual halt");
        assert!(!approve(&ctl, "BTCUSDT").is_approved());
        ctl.enable_trading();
        assert!(approve(&ctl, "BTCUSDT").is_approved());
    }
}
