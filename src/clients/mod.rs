//! External collaborators consumed by the turn cycle
//!
//! The engine owns no I/O of its own. Retrieval, structured lookups, local
//! inference, generation, and snapshot persistence are injected as trait
//! objects; each implementation owns its own timeouts.

use crate::context::models::{Chunk, EntityKind, EntityRecord, NarrativeAnalysis};
use crate::memory::BaselineSnapshot;
use crate::turn::ContextPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Collaborator call errors
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Structured store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Missing table: {0}")]
    MissingTable(String),

    #[error("Query failed: {0}")]
    Query(String),
}

/// Hybrid vector/text search over narrative chunks
#[async_trait]
pub trait RetrievalClient: Send + Sync {
    /// Search chunks; must tolerate concurrent calls
    async fn query_memory(
        &self,
        query: &str,
        k: usize,
        hybrid: bool,
    ) -> Result<Vec<Chunk>, CollaboratorError>;

    /// Most recent chunks in chronological order, optionally ending before `before`
    async fn get_recent_chunks(
        &self,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<Chunk>, CollaboratorError>;
}

/// Lookup parameters for one logical entity type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    pub kind: Option<EntityKind>,
    /// Free-text key, typically user input plus mentioned names
    pub text: String,
    /// Status filter; empty means any status
    pub statuses: Vec<String>,
    /// Ids to return in featured form
    pub featured_ids: Vec<i64>,
    /// Scope relationship lookups to these entity ids
    pub related_to: Vec<i64>,
}

impl EntityQuery {
    pub fn new(kind: EntityKind, text: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[String]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn with_featured(mut self, ids: &[i64]) -> Self {
        self.featured_ids = ids.to_vec();
        self
    }

    pub fn related_to(mut self, ids: Vec<i64>) -> Self {
        self.related_to = ids;
        self
    }
}

/// Relational entity store
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Returns an empty list, not an error, when nothing matches
    async fn lookup(&self, query: &EntityQuery) -> Result<Vec<EntityRecord>, StoreError>;
}

/// Local inference used for warm-slice analysis and query generation
#[async_trait]
pub trait LocalInference: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn analyze_narrative_context(
        &self,
        chunks: &[Chunk],
        user_input: &str,
    ) -> Result<NarrativeAnalysis, CollaboratorError>;

    async fn generate_retrieval_queries(
        &self,
        analysis: &NarrativeAnalysis,
        user_input: &str,
    ) -> Result<Vec<String>, CollaboratorError>;
}

/// Generated narrative and whatever the endpoint reports alongside it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedNarrative {
    pub narrative: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// The apex text-generation endpoint
#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    /// Disabled generators are skipped with a typed failure
    fn is_enabled(&self) -> bool {
        true
    }

    async fn generate_narrative(
        &self,
        payload: &ContextPayload,
    ) -> Result<GeneratedNarrative, CollaboratorError>;
}

/// Coarse query intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Character,
    Place,
    Faction,
    Event,
    Relationship,
    Lore,
    Generic,
}

impl QueryType {
    /// Name-centric queries lean on keyword matching
    pub fn prefers_hybrid(&self) -> bool {
        matches!(
            self,
            Self::Character | Self::Place | Self::Faction | Self::Relationship
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Place => "place",
            Self::Faction => "faction",
            Self::Event => "event",
            Self::Relationship => "relationship",
            Self::Lore => "lore",
            Self::Generic => "generic",
        }
    }
}

/// Best-effort query classifier
#[async_trait]
pub trait QueryClassifier: Send + Sync {
    async fn classify(&self, query: &str) -> Result<QueryType, CollaboratorError>;
}

/// Host-side durable log for baseline snapshots
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn persist(&self, snapshot: &BaselineSnapshot) -> Result<(), CollaboratorError>;
}
