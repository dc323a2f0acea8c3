//! Risk management: safety controller, market stress profiling, stop rules.

pub mod profile;
pub mod safety;
pub mod stops;

pub use profile::{RiskProfile, RiskProfileEngine, StressLevel};
pub use safety::{Approval, SafetyController, SafetyStatus};
pub use stops::{StopLossEvaluator, StopTrigger};
