//! Decision pipeline: ensemble combination, signal arbitration, sizing.

pub mod arbiter;
pub mod ensemble;
pub mod sizer;

pub use arbiter::{SignalArbiter, TradeDirective};
pub use ensemble::{EnsembleCombiner, EnsembleDecision, MarketRegime, MetaClassifier, ModelOutput};
pub use sizer::{PositionSizer, Sizing};
