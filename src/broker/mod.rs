//! Broker gateway: the async seam between the engine and an exchange.
//!
//! The engine only ever talks to `dyn BrokerGateway`. Transport concerns
//! (HTTP clients, retries, timeouts, rate limits) live behind this trait in
//! each implementation; the engine treats every call as a single attempt
//! and never retries within a cycle.

pub mod paper;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use paper::PaperBroker;

/// Broker-side failures. `Ambiguous` means the order may or may not exist
/// on the exchange; callers must reconcile via `get_order` before touching
/// local state.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("order rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("order notional {notional} below exchange minimum {minimum}")]
    BelowMinNotional { notional: Decimal, minimum: Decimal },

    #[error("unknown order: {0}")]
    UnknownOrder(String),

    #[error("ambiguous outcome: {0}")]
    Ambiguous(String),
}

/// Lifecycle state reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderState {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderState {
    /// Terminal states will never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected | OrderState::Expired
        )
    }
}

/// Which asset the commission was charged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionAsset {
    Base,
    Quote,
}

/// Broker truth about an order: what actually filled, at what price, and
/// what was charged. Local state is always corrected to this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub status: OrderState,

    /// Base quantity filled, before commission
    pub filled_quantity: Decimal,

    /// Quote amount spent (buys) or received (sells), before commission
    pub quote_amount: Decimal,

    pub avg_fill_price: Decimal,
    pub commission: Decimal,
    pub commission_asset: CommissionAsset,
}

impl OrderFill {
    /// Base quantity actually credited after a buy's commission.
    pub fn net_base_quantity(&self) -> Decimal {
        match self.commission_asset {
            CommissionAsset::Base => self.filled_quantity - self.commission,
            CommissionAsset::Quote => self.filled_quantity,
        }
    }

    /// Quote amount actually credited after a sell's commission.
    pub fn net_quote_amount(&self) -> Decimal {
        match self.commission_asset {
            CommissionAsset::Quote => self.quote_amount - self.commission,
            CommissionAsset::Base => self.quote_amount,
        }
    }
}

/// Acknowledgement for a resting limit order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderState,
}

/// Top of book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookTop {
    pub symbol: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Exchange operations the engine needs. One attempt per call; retry
/// policy belongs to the implementation.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Market buy spending `notional` quote currency.
    async fn place_market_buy(&self, symbol: &str, notional: Decimal) -> BrokerResult<OrderFill>;

    /// Market sell of `quantity` base asset.
    async fn place_market_sell(&self, symbol: &str, quantity: Decimal) -> BrokerResult<OrderFill>;

    /// Resting limit sell at `price`.
    async fn place_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> BrokerResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> BrokerResult<()>;

    async fn get_order(&self, symbol: &str, order_id: &str) -> BrokerResult<OrderFill>;

    async fn get_order_book(&self, symbol: &str) -> BrokerResult<OrderBookTop>;

    /// Free quote-currency balance.
    async fn get_balance(&self) -> BrokerResult<Decimal>;

    /// Free base-asset holding for `symbol`.
    async fn get_holding(&self, symbol: &str) -> BrokerResult<Decimal>;
}
