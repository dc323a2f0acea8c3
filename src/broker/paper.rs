//! Deterministic in-process exchange for paper trading and tests.
//!
//! Fills are immediate at the posted price, scaled by a configurable fill
//! ratio so partial-fill reconciliation paths stay testable. Commissions
//! mirror spot-exchange convention: buys pay in base, sells pay in quote.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    BrokerError, BrokerGateway, BrokerResult, CommissionAsset, OrderAck, OrderBookTop, OrderFill,
    OrderState,
};

/// Half-spread applied around the posted price for the synthetic book.
const BOOK_HALF_SPREAD: Decimal = dec!(0.0005);

#[derive(Debug, Clone)]
struct RestingLimitSell {
    symbol: String,
    quantity: Decimal,
    price: Decimal,
}

#[derive(Debug)]
struct PaperState {
    quote_balance: Decimal,
    holdings: HashMap<String, Decimal>,
    prices: HashMap<String, Decimal>,
    resting: HashMap<String, RestingLimitSell>,
    completed: HashMap<String, OrderFill>,
    order_seq: u64,
    fail_next: u32,
    ambiguous_next: u32,
}

pub struct PaperBroker {
    state: Mutex<PaperState>,
    commission_rate: Decimal,
    min_notional: Decimal,
    fill_ratio: Decimal,
}

impl PaperBroker {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                quote_balance: starting_balance,
                holdings: HashMap::new(),
                prices: HashMap::new(),
                resting: HashMap::new(),
                completed: HashMap::new(),
                order_seq: 0,
                fail_next: 0,
                ambiguous_next: 0,
            }),
            commission_rate: dec!(0.001),
            min_notional: dec!(10),
            fill_ratio: Decimal::ONE,
        }
    }

    /// Scale every fill by `ratio`; 0.98 leaves 2% of each order unfilled.
    pub fn with_fill_ratio(mut self, ratio: Decimal) -> Self {
        self.fill_ratio = ratio;
        self
    }

    pub fn with_commission_rate(mut self, rate: Decimal) -> Self {
        self.commission_rate = rate;
        self
    }

    /// Post a price and fill any resting limit sells it crosses.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.lock().await;
        state.prices.insert(symbol.to_string(), price);

        let crossed: Vec<String> = state
            .resting
            .iter()
            .filter(|(_, o)| o.symbol == symbol && price >= o.price)
            .map(|(id, _)| id.clone())
            .collect();

        for order_id in crossed {
            let order = state.resting.remove(&order_id).unwrap();
            let proceeds = order.quantity * order.price;
            let commission = proceeds * self.commission_rate;
            state.quote_balance += proceeds - commission;
            info!(
                symbol = %order.symbol,
                order_id = %order_id,
                price = %order.price,
                quantity = %order.quantity,
                "resting limit sell filled"
            );
            state.completed.insert(
                order_id.clone(),
                OrderFill {
                    order_id,
                    status: OrderState::Filled,
                    filled_quantity: order.quantity,
                    quote_amount: proceeds,
                    avg_fill_price: order.price,
                    commission,
                    commission_asset: CommissionAsset::Quote,
                },
            );
        }
    }

    /// Credit a base-asset holding directly, for restoring a persisted
    /// session into a fresh paper exchange.
    pub async fn seed_holding(&self, symbol: &str, quantity: Decimal) {
        let mut state = self.state.lock().await;
        *state
            .holdings
            .entry(symbol.to_string())
            .or_insert(Decimal::ZERO) += quantity;
    }

    /// Fail the next `n` order placements with a broker rejection.
    pub async fn fail_next_orders(&self, n: u32) {
        self.state.lock().await.fail_next = n;
    }

    /// Answer the next `n` order placements with an ambiguous outcome
    /// while still executing them, mimicking a timeout after the exchange
    /// accepted the order.
    pub async fn ambiguous_next_orders(&self, n: u32) {
        self.state.lock().await.ambiguous_next = n;
    }

    pub async fn holding(&self, symbol: &str) -> Decimal {
        self.state
            .lock()
            .await
            .holdings
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn next_order_id(state: &mut PaperState) -> String {
        state.order_seq += 1;
        format!("paper-{}", state.order_seq)
    }

    fn consume_failure(state: &mut PaperState) -> BrokerResult<()> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BrokerError::Rejected {
                code: "injected".to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn consume_ambiguity(state: &mut PaperState) -> bool {
        if state.ambiguous_next > 0 {
            state.ambiguous_next -= 1;
            true
        } else {
            false
        }
    }

    fn price_of(state: &PaperState, symbol: &str) -> BrokerResult<Decimal> {
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Rejected {
                code: "unknown_symbol".to_string(),
                message: format!("no price posted for {symbol}"),
            })
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn place_market_buy(&self, symbol: &str, notional: Decimal) -> BrokerResult<OrderFill> {
        let mut state = self.state.lock().await;
        Self::consume_failure(&mut state)?;

        if notional < self.min_notional {
            return Err(BrokerError::BelowMinNotional {
                notional,
                minimum: self.min_notional,
            });
        }
        if notional > state.quote_balance {
            return Err(BrokerError::InsufficientBalance {
                required: notional,
                available: state.quote_balance,
            });
        }

        let price = Self::price_of(&state, symbol)?;
        let ambiguous = Self::consume_ambiguity(&mut state);

        let filled_notional = (notional * self.fill_ratio).round_dp(8);
        let quantity = (filled_notional / price).round_dp(8);
        let commission = (quantity * self.commission_rate).round_dp(8);

        state.quote_balance -= filled_notional;
        *state.holdings.entry(symbol.to_string()).or_insert(Decimal::ZERO) +=
            quantity - commission;

        let order_id = Self::next_order_id(&mut state);
        let fill = OrderFill {
            order_id: order_id.clone(),
            status: if self.fill_ratio < Decimal::ONE {
                OrderState::PartiallyFilled
            } else {
                OrderState::Filled
            },
            filled_quantity: quantity,
            quote_amount: filled_notional,
            avg_fill_price: price,
            commission,
            commission_asset: CommissionAsset::Base,
        };
        state.completed.insert(order_id.clone(), fill.clone());
        debug!(symbol = %symbol, order_id = %order_id, notional = %filled_notional, "paper market buy");

        if ambiguous {
            return Err(BrokerError::Ambiguous(order_id));
        }
        Ok(fill)
    }

    async fn place_market_sell(&self, symbol: &str, quantity: Decimal) -> BrokerResult<OrderFill> {
        let mut state = self.state.lock().await;
        Self::consume_failure(&mut state)?;

        let held = state
            .holdings
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        if quantity > held {
            return Err(BrokerError::InsufficientBalance {
                required: quantity,
                available: held,
            });
        }

        let price = Self::price_of(&state, symbol)?;
        if quantity * price < self.min_notional {
            return Err(BrokerError::BelowMinNotional {
                notional: quantity * price,
                minimum: self.min_notional,
            });
        }
        let ambiguous = Self::consume_ambiguity(&mut state);

        let filled = (quantity * self.fill_ratio).round_dp(8);
        let proceeds = (filled * price).round_dp(8);
        let commission = (proceeds * self.commission_rate).round_dp(8);

        *state.holdings.get_mut(symbol).unwrap() -= filled;
        state.quote_balance += proceeds - commission;

        let order_id = Self::next_order_id(&mut state);
        let fill = OrderFill {
            order_id: order_id.clone(),
            status: if self.fill_ratio < Decimal::ONE {
                OrderState::PartiallyFilled
            } else {
                OrderState::Filled
            },
            filled_quantity: filled,
            quote_amount: proceeds,
            avg_fill_price: price,
            commission,
            commission_asset: CommissionAsset::Quote,
        };
        state.completed.insert(order_id.clone(), fill.clone());
        debug!(symbol = %symbol, order_id = %order_id, quantity = %filled, "paper market sell");

        if ambiguous {
            return Err(BrokerError::Ambiguous(order_id));
        }
        Ok(fill)
    }

    async fn place_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> BrokerResult<OrderAck> {
        let mut state = self.state.lock().await;
        Self::consume_failure(&mut state)?;

        let held = state
            .holdings
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        if quantity > held {
            return Err(BrokerError::InsufficientBalance {
                required: quantity,
                available: held,
            });
        }

        // Reserve the base so it cannot be double-sold while resting.
        *state.holdings.get_mut(symbol).unwrap() -= quantity;

        let order_id = Self::next_order_id(&mut state);
        state.resting.insert(
            order_id.clone(),
            RestingLimitSell {
                symbol: symbol.to_string(),
                quantity,
                price,
            },
        );
        debug!(symbol = %symbol, order_id = %order_id, price = %price, "paper limit sell resting");

        Ok(OrderAck {
            order_id,
            status: OrderState::Open,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        match state.resting.remove(order_id) {
            Some(order) => {
                // Release the reservation.
                *state
                    .holdings
                    .entry(order.symbol.clone())
                    .or_insert(Decimal::ZERO) += order.quantity;
                state.completed.insert(
                    order_id.to_string(),
                    OrderFill {
                        order_id: order_id.to_string(),
                        status: OrderState::Canceled,
                        filled_quantity: Decimal::ZERO,
                        quote_amount: Decimal::ZERO,
                        avg_fill_price: Decimal::ZERO,
                        commission: Decimal::ZERO,
                        commission_asset: CommissionAsset::Quote,
                    },
                );
                Ok(())
            }
            None => {
                if state.completed.contains_key(order_id) {
                    Err(BrokerError::Rejected {
                        code: "already_terminal".to_string(),
                        message: format!("order {order_id} already terminal"),
                    })
                } else {
                    Err(BrokerError::UnknownOrder(order_id.to_string()))
                }
            }
        }
    }

    async fn get_order(&self, _symbol: &str, order_id: &str) -> BrokerResult<OrderFill> {
        let state = self.state.lock().await;
        if let Some(order) = state.resting.get(order_id) {
            return Ok(OrderFill {
                order_id: order_id.to_string(),
                status: OrderState::Open,
                filled_quantity: Decimal::ZERO,
                quote_amount: Decimal::ZERO,
                avg_fill_price: order.price,
                commission: Decimal::ZERO,
                commission_asset: CommissionAsset::Quote,
            });
        }
        state
            .completed
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownOrder(order_id.to_string()))
    }

    async fn get_order_book(&self, symbol: &str) -> BrokerResult<OrderBookTop> {
        let state = self.state.lock().await;
        let price = Self::price_of(&state, symbol)?;
        Ok(OrderBookTop {
            symbol: symbol.to_string(),
            best_bid: price * (Decimal::ONE - BOOK_HALF_SPREAD),
            best_ask: price * (Decimal::ONE + BOOK_HALF_SPREAD),
        })
    }

    async fn get_balance(&self) -> BrokerResult<Decimal> {
        Ok(self.state.lock().await.quote_balance)
    }

    async fn get_holding(&self, symbol: &str) -> BrokerResult<Decimal> {
        Ok(self.holding(symbol).await)
    }
}
