use thiserror::Error;

use crate::types::{LegStatus, OpportunityId};

/// Errors raised by the core domain types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A leg status change that would break monotonicity.
    #[error("Invalid leg transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: LegStatus,
        /// Requested status.
        to: LegStatus,
    },

    /// An opportunity that cannot be executed.
    #[error("Invalid opportunity {id}: {reason}")]
    InvalidOpportunity {
        /// Opportunity identifier.
        id: OpportunityId,
        /// What is wrong with it.
        reason: String,
    },

    /// A configuration value out of range.
    #[error("Invalid config `{field}`: {reason}")]
    InvalidConfig {
        /// Offending field path.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl CoreError {
    /// Creates an invalid opportunity error.
    #[must_use]
    pub fn invalid_opportunity(id: &OpportunityId, reason: impl Into<String>) -> Self {
        Self::InvalidOpportunity {
            id: id.clone(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid config error.
    #[must_use]
    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}
