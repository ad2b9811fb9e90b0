//! Turn cycle
//!
//! One turn runs seven phases in a fixed order. Fatal failures abort the turn
//! and surface as `ContextError`; everything else is recorded on the turn and
//! returned in `TurnOutcome`.

pub mod assembly;
pub mod manager;

pub use assembly::{fit_payload, FittedContent};
pub use manager::TurnCycleManager;

use crate::clients::GeneratedNarrative;
use crate::context::models::{Chunk, EntityData, NarrativeAnalysis, TokenUsage};
use crate::context::token_budget::TokenBudget;
use crate::error::{ContextError, ErrorCategory};
use crate::memory::BaselineSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Phases of a turn, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    UserInput,
    WarmAnalysis,
    EntityState,
    DeepQueries,
    PayloadAssembly,
    ApexGeneration,
    Integration,
}

impl TurnPhase {
    pub const ALL: [TurnPhase; 7] = [
        TurnPhase::UserInput,
        TurnPhase::WarmAnalysis,
        TurnPhase::EntityState,
        TurnPhase::DeepQueries,
        TurnPhase::PayloadAssembly,
        TurnPhase::ApexGeneration,
        TurnPhase::Integration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserInput => "user_input",
            Self::WarmAnalysis => "warm_analysis",
            Self::EntityState => "entity_state",
            Self::DeepQueries => "deep_queries",
            Self::PayloadAssembly => "payload_assembly",
            Self::ApexGeneration => "apex_generation",
            Self::Integration => "integration",
        }
    }

    /// The phase that follows, if any
    pub fn next(&self) -> Option<TurnPhase> {
        let idx = Self::ALL.iter().position(|p| p == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host request for one turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_input: String,
    pub model_id: String,
    /// Anchor the warm slice to end before this chunk
    #[serde(default)]
    pub continuation_from: Option<i64>,
}

impl TurnRequest {
    pub fn new(user_input: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            user_input: user_input.into(),
            model_id: model_id.into(),
            continuation_from: None,
        }
    }

    pub fn continuing_from(mut self, chunk_id: i64) -> Self {
        self.continuation_from = Some(chunk_id);
        self
    }
}

/// Non-fatal failure recorded during a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnErrorEntry {
    pub phase: TurnPhase,
    pub category: ErrorCategory,
    pub message: String,
}

impl TurnErrorEntry {
    pub fn from_error(phase: TurnPhase, error: &ContextError) -> Self {
        Self {
            phase,
            category: error.category(),
            message: error.to_string(),
        }
    }
}

/// Pass-2 results folded into the turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pass2Summary {
    pub divergence_detected: bool,
    pub confidence: f32,
    pub new_chunk_ids: Vec<i64>,
    pub tokens_consumed: usize,
    pub remaining_budget: usize,
    pub warm_expansion: bool,
}

/// Metadata attached to the generation payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub turn_id: Uuid,
    pub model_id: String,
    pub budget: TokenBudget,
    pub token_usage: TokenUsage,
    pub utilization: f64,
    pub within_bands: bool,
    pub trimmed_records: usize,
    pub divergence_detected: bool,
    pub divergence_confidence: f32,
}

/// Everything handed to the generation endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub user_input: String,
    pub warm_slice: Vec<Chunk>,
    pub entity_data: EntityData,
    /// Deep-query passages and pass-2 augmentations, highest score first
    pub retrieved_passages: Vec<Chunk>,
    pub analysis: NarrativeAnalysis,
    pub metadata: PayloadMetadata,
}

/// Why generation produced no narrative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationFailure {
    /// No generator configured
    Uninitialized,
    Disabled,
    Error,
}

/// Result of the generation phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Generated(GeneratedNarrative),
    Failed {
        reason: GenerationFailure,
        message: String,
    },
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Generated(_))
    }

    pub fn narrative(&self) -> Option<&str> {
        match self {
            Self::Generated(generated) => Some(&generated.narrative),
            Self::Failed { .. } => None,
        }
    }

    fn failed(reason: GenerationFailure, message: impl Into<String>) -> Self {
        Self::Failed {
            reason,
            message: message.into(),
        }
    }
}

/// Mutable state of one in-flight turn
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub turn_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub request: TurnRequest,
    pub phase: TurnPhase,
    pub completed: Vec<TurnPhase>,
    pub budget: TokenBudget,
    pub pass2: Option<Pass2Summary>,
    pub warm_slice: Vec<Chunk>,
    pub analysis: NarrativeAnalysis,
    pub entity_data: EntityData,
    pub featured_ids: Vec<i64>,
    pub deep_queries: Vec<String>,
    pub retrieved: Vec<Chunk>,
    pub augmentations: Vec<Chunk>,
    pub payload: Option<ContextPayload>,
    pub token_usage: TokenUsage,
    pub errors: Vec<TurnErrorEntry>,
}

impl TurnContext {
    pub fn new(request: TurnRequest) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            started_at: Utc::now(),
            request,
            phase: TurnPhase::UserInput,
            completed: Vec::new(),
            budget: TokenBudget::default(),
            pass2: None,
            warm_slice: Vec::new(),
            analysis: NarrativeAnalysis::default(),
            entity_data: EntityData::default(),
            featured_ids: Vec::new(),
            deep_queries: Vec::new(),
            retrieved: Vec::new(),
            augmentations: Vec::new(),
            payload: None,
            token_usage: TokenUsage::default(),
            errors: Vec::new(),
        }
    }

    /// Move to the next phase; phases never repeat or skip
    pub(crate) fn complete_phase(&mut self) {
        self.completed.push(self.phase);
        if let Some(next) = self.phase.next() {
            self.phase = next;
        }
    }

    pub(crate) fn record_error(&mut self, error: &ContextError) {
        self.errors.push(TurnErrorEntry::from_error(self.phase, error));
    }
}

/// What a finished turn hands back to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub turn_id: Uuid,
    pub generation: GenerationOutcome,
    pub token_usage: TokenUsage,
    pub pass2: Option<Pass2Summary>,
    pub snapshot: Option<BaselineSnapshot>,
    pub phases: Vec<TurnPhase>,
    pub errors: Vec<TurnErrorEntry>,
}

impl TurnOutcome {
    pub fn narrative(&self) -> Option<&str> {
        self.generation.narrative()
    }
}
