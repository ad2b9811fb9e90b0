//! Context management with token budget enforcement
//!
//! This module holds the per-turn token budget, the query ledger, and the
//! baseline/incremental context state shared across a turn cycle.

pub mod models;
pub mod query_memory;
pub mod state;
pub mod token_budget;
pub mod token_estimator;

pub use models::{
    BaselineEntity, BudgetComponent, Chunk, EntityData, EntityKind, EntityRecord, EntityRef,
    FeaturedEntity, NarrativeAnalysis, TieredEntities, TokenUsage,
};
pub use query_memory::{Pass, QueryMemory};
pub use state::{ContextPackage, ContextState, ContextStateManager, ContextSummary, PassTransition};
pub use token_budget::{
    BudgetError, ComponentBand, ComponentBands, ContentAvailability, IncrementalReserve,
    TokenBudget, TokenBudgetConfig, TokenBudgetManager,
};
pub use token_estimator::{TiktokenEstimator, TokenEstimator, WordBasedEstimator};
