//! Data models for positions, signals, trade records, and market snapshots.

mod position;
mod record;
mod signal;
mod snapshot;

pub use position::{Position, RestingOrder};
pub use record::{ExecutionMode, ReasonCode, TradeRecord, TradeSide};
pub use signal::{SignalKind, SignalRecord, SignalSource};
pub use snapshot::MarketSnapshot;
