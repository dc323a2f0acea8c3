//! Execution ledger: the only code allowed to move money.
//!
//! Every broker call follows the same discipline: take the state lock,
//! reserve or snapshot, release the lock, make the single broker attempt,
//! then re-take the lock and reconcile local state against what the broker
//! reports. The broker is the source of truth; local state is always
//! corrected toward it, never the other way around. No broker call is ever
//! made while holding the lock, and nothing is retried within a cycle.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::broker::{BrokerError, BrokerGateway, OrderFill, OrderState};
use crate::config::EngineConfig;
use crate::engine::session::SessionState;
use crate::error::EngineResult;
use crate::models::{Position, ReasonCode, RestingOrder, SignalKind, TradeRecord, TradeSide};
use crate::risk::safety::SafetyController;
use crate::db::Database;

/// Outcome of a buy attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum BuyOutcome {
    Executed {
        quantity: Decimal,
        notional: Decimal,
    },
    Skipped {
        code: ReasonCode,
        detail: String,
    },
}

/// Outcome of a sell attempt. Skips are normal control flow; the caller
/// decides whether the position survives based on the code.
#[derive(Debug, Clone, PartialEq)]
pub enum SellOutcome {
    Executed { pnl: Decimal },
    Skipped { code: ReasonCode, detail: String },
}

pub struct ExecutionLedger {
    session_id: String,
    config: Arc<EngineConfig>,
    broker: Arc<dyn BrokerGateway>,
    db: Database,
    safety: Arc<SafetyController>,
    state: Arc<Mutex<SessionState>>,
}

impl ExecutionLedger {
    pub fn new(
        session_id: String,
        config: Arc<EngineConfig>,
        broker: Arc<dyn BrokerGateway>,
        db: Database,
        safety: Arc<SafetyController>,
        state: Arc<Mutex<SessionState>>,
    ) -> Self {
        Self {
            session_id,
            config,
            broker,
            db,
            safety,
            state,
        }
    }

    /// Buy `notional` worth of `symbol`: reserve, submit, reconcile.
    pub async fn execute_buy(
        &self,
        symbol: &str,
        notional: Decimal,
        signal: SignalKind,
        confidence: f64,
    ) -> EngineResult<BuyOutcome> {
        // Reserve optimistically under the lock. Sizing ran against an
        // earlier snapshot, so the balance must be re-checked here.
        {
            let mut state = self.state.lock().await;
            if notional > state.balance {
                let detail = format!(
                    "reserve {notional} exceeds free balance {}",
                    state.balance
                );
                drop(state);
                self.journal_rejection(symbol, TradeSide::Buy, ReasonCode::SizingRejected, &detail)
                    .await?;
                return Ok(BuyOutcome::Skipped {
                    code: ReasonCode::SizingRejected,
                    detail,
                });
            }
            state.balance -= notional;
        }

        let result = self.broker.place_market_buy(symbol, notional).await;

        let fill = match result {
            Ok(fill) => {
                self.safety.record_api_success();
                fill
            }
            Err(BrokerError::Ambiguous(order_id)) => {
                // The order may exist. Ask the broker before touching state.
                match self.broker.get_order(symbol, &order_id).await {
                    Ok(fill) if fill.filled_quantity > Decimal::ZERO => {
                        info!(
                            symbol = %symbol,
                            order_id = %order_id,
                            "ambiguous buy resolved to a fill"
                        );
                        self.safety.record_api_success();
                        fill
                    }
                    _ => {
                        self.rollback_reserve(notional).await;
                        self.safety.record_api_failure();
                        let detail = format!("order {order_id} unresolved after timeout");
                        self.journal_rejection(
                            symbol,
                            TradeSide::Buy,
                            ReasonCode::BrokerAmbiguous,
                            &detail,
                        )
                        .await?;
                        return Ok(BuyOutcome::Skipped {
                            code: ReasonCode::BrokerAmbiguous,
                            detail,
                        });
                    }
                }
            }
            Err(e) => {
                self.rollback_reserve(notional).await;
                let code = match &e {
                    BrokerError::BelowMinNotional { .. } => ReasonCode::BelowMinNotional,
                    BrokerError::InsufficientBalance { .. } => {
                        ReasonCode::InsufficientExchangeBalance
                    }
                    _ => ReasonCode::BrokerRejected,
                };
                if matches!(code, ReasonCode::BrokerRejected) {
                    self.safety.record_api_failure();
                }
                let detail = e.to_string();
                self.journal_rejection(symbol, TradeSide::Buy, code, &detail).await?;
                return Ok(BuyOutcome::Skipped { code, detail });
            }
        };

        // Reconcile: return the unspent part of the reserve and credit the
        // net filled quantity at the broker's price.
        let net_quantity = fill.net_base_quantity();
        let avg_price = fill.avg_fill_price;
        {
            let mut state = self.state.lock().await;
            let refund = notional - fill.quote_amount;
            if refund > Decimal::ZERO {
                state.balance += refund;
            }
            match state.positions.get_mut(symbol) {
                Some(pos) => {
                    pos.add(net_quantity, avg_price, confidence);
                    pos.take_profit_price =
                        pos.avg_price * (Decimal::ONE + self.config.take_profit_pct);
                    pos.stop_loss_price =
                        pos.avg_price * (Decimal::ONE - self.config.stop_loss_pct);
                }
                None => {
                    let pos = Position::new(
                        symbol.to_string(),
                        net_quantity,
                        avg_price,
                        avg_price * (Decimal::ONE + self.config.take_profit_pct),
                        avg_price * (Decimal::ONE - self.config.stop_loss_pct),
                        confidence,
                    );
                    state.positions.insert(symbol.to_string(), pos);
                }
            }
        }

        if fill.status == OrderState::PartiallyFilled {
            warn!(
                symbol = %symbol,
                requested = %notional,
                filled = %fill.quote_amount,
                "partial fill reconciled"
            );
        }
        info!(
            symbol = %symbol,
            order_id = %fill.order_id,
            quantity = %net_quantity,
            price = %avg_price,
            "buy executed"
        );

        let record = TradeRecord::fill(
            symbol,
            TradeSide::Buy,
            fill.filled_quantity,
            avg_price,
            Decimal::ZERO,
            Some(signal),
            confidence,
            self.config.execution_mode,
            fill.order_id.clone(),
            fill.commission,
            ReasonCode::Filled,
        );
        self.db.record_trade(&self.session_id, &record).await?;

        Ok(BuyOutcome::Executed {
            quantity: net_quantity,
            notional: fill.quote_amount,
        })
    }

    /// Sell the entire position in `symbol`, cancelling its resting
    /// take-profit first so the base quantity is free to sell.
    pub async fn execute_sell(
        &self,
        symbol: &str,
        reason: ReasonCode,
        signal: Option<SignalKind>,
        confidence: f64,
    ) -> EngineResult<SellOutcome> {
        let (quantity, resting) = {
            let state = self.state.lock().await;
            let Some(pos) = state.positions.get(symbol) else {
                return Ok(SellOutcome::Skipped {
                    code: ReasonCode::Hold,
                    detail: format!("no open position in {symbol}"),
                });
            };
            (pos.quantity, state.resting_orders.get(symbol).cloned())
        };

        if let Some(order) = resting {
            match self.broker.cancel_order(symbol, &order.order_id).await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    state.resting_orders.remove(symbol);
                }
                Err(_) => {
                    // Cancel failed; the order may have filled underneath us.
                    match self.broker.get_order(symbol, &order.order_id).await {
                        Ok(fill) if fill.status == OrderState::Filled => {
                            self.apply_resting_fill(symbol, &fill).await?;
                            return Ok(SellOutcome::Skipped {
                                code: ReasonCode::TakeProfit,
                                detail: "resting take-profit filled before sell".to_string(),
                            });
                        }
                        Ok(fill) if fill.status.is_terminal() => {
                            let mut state = self.state.lock().await;
                            state.resting_orders.remove(symbol);
                        }
                        _ => {
                            self.safety.record_api_failure();
                            return Ok(SellOutcome::Skipped {
                                code: ReasonCode::BrokerRejected,
                                detail: format!(
                                    "could not cancel resting order {}",
                                    order.order_id
                                ),
                            });
                        }
                    }
                }
            }
        }

        let result = self.broker.place_market_sell(symbol, quantity).await;

        let fill = match result {
            Ok(fill) => {
                self.safety.record_api_success();
                fill
            }
            Err(BrokerError::InsufficientBalance { required, available }) => {
                // The exchange disagrees about what we hold. Its view wins.
                return self.reconcile_holdings(symbol, required, available).await;
            }
            Err(BrokerError::BelowMinNotional { notional, minimum }) => {
                // Dust position: keep it, journal the skip, try no further
                // this cycle.
                let detail = format!("position notional {notional} below minimum {minimum}");
                warn!(symbol = %symbol, %notional, %minimum, "sell skipped: dust position");
                self.journal_rejection(symbol, TradeSide::Sell, ReasonCode::BelowMinNotional, &detail)
                    .await?;
                return Ok(SellOutcome::Skipped {
                    code: ReasonCode::BelowMinNotional,
                    detail,
                });
            }
            Err(BrokerError::Ambiguous(order_id)) => {
                match self.broker.get_order(symbol, &order_id).await {
                    Ok(fill) if fill.filled_quantity > Decimal::ZERO => {
                        info!(symbol = %symbol, order_id = %order_id, "ambiguous sell resolved to a fill");
                        self.safety.record_api_success();
                        fill
                    }
                    _ => {
                        self.safety.record_api_failure();
                        let detail = format!("sell order {order_id} unresolved after timeout");
                        self.journal_rejection(
                            symbol,
                            TradeSide::Sell,
                            ReasonCode::BrokerAmbiguous,
                            &detail,
                        )
                        .await?;
                        return Ok(SellOutcome::Skipped {
                            code: ReasonCode::BrokerAmbiguous,
                            detail,
                        });
                    }
                }
            }
            Err(e) => {
                self.safety.record_api_failure();
                let detail = e.to_string();
                self.journal_rejection(symbol, TradeSide::Sell, ReasonCode::BrokerRejected, &detail)
                    .await?;
                return Ok(SellOutcome::Skipped {
                    code: ReasonCode::BrokerRejected,
                    detail,
                });
            }
        };

        let pnl = {
            let mut state = self.state.lock().await;
            let pnl = match state.positions.get_mut(symbol) {
                Some(pos) => {
                    let pnl = pos.reduce(fill.filled_quantity, fill.avg_fill_price);
                    if pos.is_closed() {
                        state.positions.remove(symbol);
                    }
                    pnl
                }
                None => Decimal::ZERO,
            };
            state.balance += fill.net_quote_amount();
            state.realized_pnl += pnl;
            pnl
        };

        self.safety.register_result(symbol, pnl, None);
        info!(
            symbol = %symbol,
            order_id = %fill.order_id,
            quantity = %fill.filled_quantity,
            price = %fill.avg_fill_price,
            pnl = %pnl,
            reason = reason.as_str(),
            "sell executed"
        );

        let record = TradeRecord::fill(
            symbol,
            TradeSide::Sell,
            fill.filled_quantity,
            fill.avg_fill_price,
            pnl,
            signal,
            confidence,
            self.config.execution_mode,
            fill.order_id.clone(),
            fill.commission,
            reason,
        );
        self.db.record_trade(&self.session_id, &record).await?;

        Ok(SellOutcome::Executed { pnl })
    }

    /// Place or reprice the resting take-profit for a symbol's position.
    pub async fn sync_take_profit(&self, symbol: &str) -> EngineResult<()> {
        let (position, resting) = {
            let state = self.state.lock().await;
            (
                state.positions.get(symbol).cloned(),
                state.resting_orders.get(symbol).cloned(),
            )
        };

        let Some(position) = position else {
            // Orphan resting order with no position behind it: cancel it.
            if let Some(order) = resting {
                if let Err(e) = self.broker.cancel_order(symbol, &order.order_id).await {
                    warn!(symbol = %symbol, error = %e, "orphan resting order cancel failed");
                }
                let mut state = self.state.lock().await;
                state.resting_orders.remove(symbol);
            }
            return Ok(());
        };

        let book = self.broker.get_order_book(symbol).await?;
        let profit_target = position.avg_price * (Decimal::ONE + self.config.take_profit_pct);
        let ask_floor = book.best_ask * (Decimal::ONE + self.config.spread_margin_pct);
        let desired = profit_target.max(ask_floor);

        if let Some(order) = &resting {
            let drift = if order.target_price.is_zero() {
                Decimal::ONE
            } else {
                ((desired - order.target_price) / order.target_price).abs()
            };
            if order.quantity == position.quantity && drift <= self.config.reprice_threshold_pct {
                let mut state = self.state.lock().await;
                if let Some(o) = state.resting_orders.get_mut(symbol) {
                    o.last_checked = Utc::now();
                }
                return Ok(());
            }
            match self.broker.cancel_order(symbol, &order.order_id).await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    state.resting_orders.remove(symbol);
                }
                Err(e) => {
                    // Likely filled underneath us; the next resting-fill
                    // sweep will pick it up.
                    warn!(symbol = %symbol, error = %e, "take-profit cancel failed, skipping reprice");
                    return Ok(());
                }
            }
        }

        match self
            .broker
            .place_limit_sell(symbol, position.quantity, desired)
            .await
        {
            Ok(ack) => {
                info!(
                    symbol = %symbol,
                    order_id = %ack.order_id,
                    price = %desired,
                    quantity = %position.quantity,
                    "take-profit resting"
                );
                let mut state = self.state.lock().await;
                state.resting_orders.insert(
                    symbol.to_string(),
                    RestingOrder::new(
                        symbol.to_string(),
                        ack.order_id,
                        desired,
                        position.quantity,
                    ),
                );
                Ok(())
            }
            Err(e) => {
                self.safety.record_api_failure();
                warn!(symbol = %symbol, error = %e, "take-profit placement failed");
                Ok(())
            }
        }
    }

    /// Sweep resting orders for fills and terminal states.
    pub async fn process_resting_fills(&self) -> EngineResult<()> {
        let orders: Vec<RestingOrder> = {
            let state = self.state.lock().await;
            state.resting_orders.values().cloned().collect()
        };

        for order in orders {
            match self.broker.get_order(&order.symbol, &order.order_id).await {
                Ok(fill) if fill.status == OrderState::Filled => {
                    self.apply_resting_fill(&order.symbol, &fill).await?;
                }
                Ok(fill) if fill.status.is_terminal() => {
                    info!(
                        symbol = %order.symbol,
                        order_id = %order.order_id,
                        status = ?fill.status,
                        "resting order terminal without fill, dropping"
                    );
                    let mut state = self.state.lock().await;
                    state.resting_orders.remove(&order.symbol);
                }
                Ok(_) => {}
                Err(BrokerError::UnknownOrder(_)) => {
                    warn!(
                        symbol = %order.symbol,
                        order_id = %order.order_id,
                        "resting order unknown to broker, dropping"
                    );
                    let mut state = self.state.lock().await;
                    state.resting_orders.remove(&order.symbol);
                }
                Err(e) => {
                    self.safety.record_api_failure();
                    error!(symbol = %order.symbol, error = %e, "resting order status check failed");
                }
            }
        }
        Ok(())
    }

    /// Apply a filled resting take-profit to local state.
    async fn apply_resting_fill(&self, symbol: &str, fill: &OrderFill) -> EngineResult<()> {
        let pnl = {
            let mut state = self.state.lock().await;
            state.resting_orders.remove(symbol);
            let pnl = match state.positions.get_mut(symbol) {
                Some(pos) => {
                    let pnl = pos.reduce(fill.filled_quantity, fill.avg_fill_price);
                    if pos.is_closed() {
                        state.positions.remove(symbol);
                    }
                    pnl
                }
                None => Decimal::ZERO,
            };
            state.balance += fill.net_quote_amount();
            state.realized_pnl += pnl;
            pnl
        };

        self.safety.register_result(symbol, pnl, None);
        info!(
            symbol = %symbol,
            order_id = %fill.order_id,
            price = %fill.avg_fill_price,
            pnl = %pnl,
            "take-profit filled"
        );

        let record = TradeRecord::fill(
            symbol,
            TradeSide::Sell,
            fill.filled_quantity,
            fill.avg_fill_price,
            pnl,
            None,
            0.0,
            self.config.execution_mode,
            fill.order_id.clone(),
            fill.commission,
            ReasonCode::TakeProfit,
        );
        self.db.record_trade(&self.session_id, &record).await?;
        Ok(())
    }

    /// The exchange refused a sell for lack of holdings: adopt its view.
    async fn reconcile_holdings(
        &self,
        symbol: &str,
        required: Decimal,
        available: Decimal,
    ) -> EngineResult<SellOutcome> {
        let broker_held = self
            .broker
            .get_holding(symbol)
            .await
            .unwrap_or(available);

        let detail = {
            let mut state = self.state.lock().await;
            let detail = format!(
                "local quantity {required} vs broker {broker_held}, corrected to broker"
            );
            if broker_held <= Decimal::new(1, 6) {
                state.positions.remove(symbol);
            } else if let Some(pos) = state.positions.get_mut(symbol) {
                pos.quantity = broker_held;
            }
            detail
        };

        error!(symbol = %symbol, %required, %broker_held, "reconciliation drift on sell");
        self.journal_rejection(symbol, TradeSide::Sell, ReasonCode::ReconciliationDrift, &detail)
            .await?;

        Ok(SellOutcome::Skipped {
            code: ReasonCode::ReconciliationDrift,
            detail,
        })
    }

    async fn rollback_reserve(&self, notional: Decimal) {
        let mut state = self.state.lock().await;
        state.balance += notional;
    }

    async fn journal_rejection(
        &self,
        symbol: &str,
        side: TradeSide,
        code: ReasonCode,
        detail: &str,
    ) -> EngineResult<()> {
        let record = TradeRecord::rejection(
            symbol,
            side,
            self.config.execution_mode,
            code,
            detail,
        );
        self.db.record_trade(&self.session_id, &record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use rust_decimal_macros::dec;

    struct Harness {
        ledger: ExecutionLedger,
        broker: Arc<PaperBroker>,
        state: Arc<Mutex<SessionState>>,
        db: Database,
    }

    async fn harness(broker: PaperBroker) -> Harness {
        let broker = Arc::new(broker);
        broker.set_price("BTCUSDT", dec!(100)).await;
        let db = Database::in_memory().await.unwrap();
        let config = Arc::new(EngineConfig::default());
        let safety = Arc::new(SafetyController::new((*config).clone()));
        let state = Arc::new(Mutex::new(SessionState::new(dec!(1000))));
        let ledger = ExecutionLedger::new(
            "test".to_string(),
            config,
            broker.clone(),
            db.clone(),
            safety,
            state.clone(),
        );
        Harness {
            ledger,
            broker,
            state,
            db,
        }
    }

    #[tokio::test]
    async fn test_buy_reserves_and_reconciles() {
        let h = harness(PaperBroker::new(dec!(1000))).await;

        let outcome = h
            .ledger
            .execute_buy("BTCUSDT", dec!(200), SignalKind::Buy, 0.8)
            .await
            .unwrap();
        let BuyOutcome::Executed { quantity, notional } = outcome else {
            panic!("expected executed buy, got {outcome:?}");
        };
        assert_eq!(quantity, dec!(1.998));
        assert_eq!(notional, dec!(200));

        let state = h.state.lock().await;
        assert_eq!(state.balance, dec!(800));
        let pos = &state.positions["BTCUSDT"];
        assert_eq!(pos.avg_price, dec!(100));
        assert_eq!(pos.quantity, dec!(1.998));
        assert_eq!(pos.take_profit_price, dec!(103));
        assert_eq!(pos.stop_loss_price, dec!(95));
    }

    #[tokio::test]
    async fn test_partial_fill_refunds_unspent_reserve() {
        let h = harness(PaperBroker::new(dec!(1000)).with_fill_ratio(dec!(0.98))).await;

        let outcome = h
            .ledger
            .execute_buy("BTCUSDT", dec!(200), SignalKind::Buy, 0.8)
            .await
            .unwrap();
        assert!(matches!(outcome, BuyOutcome::Executed { .. }));

        let state = h.state.lock().await;
        assert_eq!(state.balance, dec!(804));
        assert_eq!(state.positions["BTCUSDT"].quantity, dec!(1.95804));
    }

    #[tokio::test]
    async fn test_rejected_buy_rolls_back_reserve() {
        let h = harness(PaperBroker::new(dec!(1000))).await;
        h.broker.fail_next_orders(1).await;

        let outcome = h
            .ledger
            .execute_buy("BTCUSDT", dec!(200), SignalKind::Buy, 0.8)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            BuyOutcome::Skipped {
                code: ReasonCode::BrokerRejected,
                ..
            }
        ));

        let state = h.state.lock().await;
        assert_eq!(state.balance, dec!(1000));
        assert!(state.positions.is_empty());
        drop(state);

        let entries = h.db.recent_trades("test", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_buy_resolved_via_lookup() {
        let h = harness(PaperBroker::new(dec!(1000))).await;
        h.broker.ambiguous_next_orders(1).await;

        let outcome = h
            .ledger
            .execute_buy("BTCUSDT", dec!(200), SignalKind::Buy, 0.8)
            .await
            .unwrap();
        assert!(matches!(outcome, BuyOutcome::Executed { .. }));

        let state = h.state.lock().await;
        assert_eq!(state.balance, dec!(800));
        assert_eq!(state.positions["BTCUSDT"].quantity, dec!(1.998));
    }

    #[tokio::test]
    async fn test_dust_position_sell_skipped() {
        let h = harness(PaperBroker::new(dec!(1000))).await;
        h.broker.seed_holding("BTCUSDT", dec!(0.05)).await;
        {
            let mut state = h.state.lock().await;
            state.positions.insert(
                "BTCUSDT".to_string(),
                Position::new(
                    "BTCUSDT".to_string(),
                    dec!(0.05),
                    dec!(100),
                    dec!(103),
                    dec!(95),
                    0.5,
                ),
            );
        }

        let outcome = h
            .ledger
            .execute_sell("BTCUSDT", ReasonCode::Filled, None, 0.0)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SellOutcome::Skipped {
                code: ReasonCode::BelowMinNotional,
                ..
            }
        ));
        assert!(h.state.lock().await.positions.contains_key("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_sell_adopts_broker_holdings_on_drift() {
        let h = harness(PaperBroker::new(dec!(1000))).await;
        // Local state claims a position the exchange has no holdings for.
        {
            let mut state = h.state.lock().await;
            state.positions.insert(
                "BTCUSDT".to_string(),
                Position::new(
                    "BTCUSDT".to_string(),
                    dec!(2),
                    dec!(100),
                    dec!(103),
                    dec!(95),
                    0.5,
                ),
            );
        }

        let outcome = h
            .ledger
            .execute_sell("BTCUSDT", ReasonCode::Filled, None, 0.0)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SellOutcome::Skipped {
                code: ReasonCode::ReconciliationDrift,
                ..
            }
        ));
        assert!(h.state.lock().await.positions.is_empty());
    }

    #[tokio::test]
    async fn test_take_profit_placed_then_repriced_on_growth() {
        let h = harness(PaperBroker::new(dec!(1000))).await;
        h.ledger
            .execute_buy("BTCUSDT", dec!(200), SignalKind::Buy, 0.8)
            .await
            .unwrap();
        h.ledger.sync_take_profit("BTCUSDT").await.unwrap();

        {
            let state = h.state.lock().await;
            let order = &state.resting_orders["BTCUSDT"];
            assert_eq!(order.target_price, dec!(103));
            assert_eq!(order.quantity, dec!(1.998));
        }

        // Doubling the position forces a cancel-and-replace at full size.
        h.ledger
            .execute_buy("BTCUSDT", dec!(200), SignalKind::Buy, 0.8)
            .await
            .unwrap();
        h.ledger.sync_take_profit("BTCUSDT").await.unwrap();

        let state = h.state.lock().await;
        let order = &state.resting_orders["BTCUSDT"];
        assert_eq!(order.quantity, dec!(3.996));
        assert_eq!(order.target_price, dec!(103));
    }

    #[tokio::test]
    async fn test_resting_fill_sweep_realizes_pnl() {
        let h = harness(PaperBroker::new(dec!(1000))).await;
        h.ledger
            .execute_buy("BTCUSDT", dec!(200), SignalKind::Buy, 0.8)
            .await
            .unwrap();
        h.ledger.sync_take_profit("BTCUSDT").await.unwrap();

        // Cross the take-profit target, then sweep.
        h.broker.set_price("BTCUSDT", dec!(110)).await;
        h.ledger.process_resting_fills().await.unwrap();

        let state = h.state.lock().await;
        assert!(state.positions.is_empty());
        assert!(state.resting_orders.is_empty());
        assert_eq!(state.realized_pnl, dec!(5.994));
        assert!(state.balance > dec!(1000));
    }

    #[tokio::test]
    async fn test_unknown_resting_order_dropped() {
        let h = harness(PaperBroker::new(dec!(1000))).await;
        {
            let mut state = h.state.lock().await;
            state.resting_orders.insert(
                "BTCUSDT".to_string(),
                RestingOrder::new(
                    "BTCUSDT".to_string(),
                    "stale-after-restart".to_string(),
                    dec!(103),
                    dec!(1),
                ),
            );
        }

        h.ledger.process_resting_fills().await.unwrap();
        assert!(h.state.lock().await.resting_orders.is_empty());
    }
}
