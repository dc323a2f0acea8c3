//! Engine error taxonomy.
//!
//! Only unexpected faults are errors. Safety rejections and broker skips are
//! part of normal control flow and are modeled as result enums
//! ([`crate::risk::safety::Approval`], [`crate::engine::execution::SellOutcome`]),
//! never as `Err` values.

use thiserror::Error;

/// Faults that abort the current operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input rejected before any state mutation.
    #[error("validation: {0}")]
    Validation(String),

    /// A broker call failed in a way the caller cannot resolve locally.
    #[error("broker failure ({code}): {message}")]
    Broker { code: String, message: String },

    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl From<crate::broker::BrokerError> for EngineError {
    fn from(e: crate::broker::BrokerError) -> Self {
        let code = match &e {
            crate::broker::BrokerError::Rejected { code, .. } => code.clone(),
            crate::broker::BrokerError::InsufficientBalance { .. } => {
                "insufficient_balance".to_string()
            }
            crate::broker::BrokerError::BelowMinNotional { .. } => "below_min_notional".to_string(),
            crate::broker::BrokerError::UnknownOrder(_) => "unknown_order".to_string(),
            crate::broker::BrokerError::Ambiguous(_) => "ambiguous".to_string(),
        };
        EngineError::Broker {
            code,
            message: e.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
