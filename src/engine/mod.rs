//! Engine core: the execution ledger and the per-tenant trading session.

pub mod execution;
pub mod session;

pub use execution::{BuyOutcome, ExecutionLedger, SellOutcome};
pub use session::{PortfolioSummary, SessionState, TradingSession};
