//! Dual-pass context engine
//!
//! Decides, turn by turn, which narrative history, world state, and retrieved
//! material fit in a fixed context window for a downstream generation call.
//! After each generated turn a baseline is committed (pass 1); the next user
//! input is checked against it for divergence and only missing material is
//! retrieved within the remaining budget (pass 2).

pub mod clients;
pub mod config;
pub mod context;
pub mod divergence;
pub mod error;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod retrieval;
pub mod turn;

pub use config::Config;
pub use context::{
    Chunk, ContextState, ContextStateManager, EntityData, QueryMemory, TokenBudget,
    TokenBudgetManager,
};
pub use divergence::{
    DivergenceDetection, DivergenceResult, HeuristicDivergenceDetector, LlmDivergenceDetector,
};
pub use error::{ContextError, ErrorCategory, Result};
pub use memory::{BaselineSnapshot, DualPassMemory};
pub use metrics::TurnMetrics;
pub use retrieval::IncrementalRetriever;
pub use turn::{TurnCycleManager, TurnOutcome, TurnPhase, TurnRequest};
