//! Error types for the dual-pass context engine
//!
//! Every failure maps onto one of five categories. Only the two fatal
//! categories abort a turn; the others are logged and recorded on the turn.

use crate::context::token_budget::BudgetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, ContextError>;

/// How a failure propagates through a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Required configuration missing or invalid; raised, never defaulted
    FatalConfiguration,
    /// Local inference unavailable or returned nothing where required
    FatalSemantic,
    /// Structured lookup failed; empty result, turn continues
    Degraded,
    /// Divergence enrichment failed; treated as no divergence
    BestEffort,
    /// Post-generation persistence failed; turn still succeeds
    RecoverableIntegration,
}

impl ErrorCategory {
    /// Whether errors of this category abort the turn
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::FatalConfiguration | Self::FatalSemantic)
    }
}

/// Context engine errors
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Semantic analysis failed: {0}")]
    Semantic(String),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Structured data degraded: {0}")]
    Degraded(String),

    #[error("Divergence enrichment failed: {0}")]
    Enrichment(String),

    #[error("Integration failed: {0}")]
    Integration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ContextError {
    /// Map the error onto its propagation category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::Budget(_) => ErrorCategory::FatalConfiguration,
            Self::Semantic(_) => ErrorCategory::FatalSemantic,
            Self::Degraded(_) => ErrorCategory::Degraded,
            Self::Enrichment(_) => ErrorCategory::BestEffort,
            Self::Integration(_) | Self::Serialization(_) => {
                ErrorCategory::RecoverableIntegration
            }
        }
    }

    /// Whether this error must abort the turn and surface to the host
    pub fn is_fatal(&self) -> bool {
        self.category().is_fatal()
    }
}

impl From<config::ConfigError> for ContextError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
