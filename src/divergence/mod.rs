//! Divergence detection
//!
//! Decides whether user input references material outside the active
//! baseline. Two interchangeable detectors share one result type:
//! - `HeuristicDivergenceDetector`: reference extraction against known vocabulary
//! - `LlmDivergenceDetector`: structured model output, fails soft

pub mod chat_model;
pub mod heuristic;
pub mod json_extract;
pub mod llm;

pub use chat_model::{ChatCompletionConfig, ChatCompletionModel};
pub use heuristic::HeuristicDivergenceDetector;
pub use llm::{LlmDivergenceDetector, ModelError, StructuredModel};

use crate::context::state::{ContextPackage, PassTransition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Retrieval query derived from a detected gap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapQuery {
    pub query: String,
    /// Annotated onto every chunk this query pulls in
    pub label: String,
}

impl GapQuery {
    pub fn new(query: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            label: label.into(),
        }
    }
}

/// Findings of the heuristic detector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicDivergence {
    pub detected: bool,
    pub confidence: f32,
    /// Unmatched references worth retrieving, proper-noun phrases first
    pub gaps: Vec<String>,
    pub unmatched_entities: Vec<String>,
    pub references_seen: Vec<String>,
}

/// Enrichment requested by the semantic detector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnrichmentPlan {
    pub enrichment_searches: Vec<String>,
    pub entity_ids_to_feature: Vec<i64>,
    pub enrichment_reason: Option<String>,
}

/// Outcome of divergence detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DivergenceResult {
    /// Not evaluated
    Clear,
    /// Evaluation failed soft; treated as no divergence
    Failed { reason: String },
    Heuristic(HeuristicDivergence),
    Semantic(EnrichmentPlan),
}

impl DivergenceResult {
    pub fn detected(&self) -> bool {
        match self {
            Self::Clear | Self::Failed { .. } => false,
            Self::Heuristic(h) => h.detected,
            Self::Semantic(plan) => {
                !plan.enrichment_searches.is_empty() || !plan.entity_ids_to_feature.is_empty()
            }
        }
    }

    /// In [0, 1]; the semantic detector reports 1.0 or 0.0
    pub fn confidence(&self) -> f32 {
        match self {
            Self::Clear | Self::Failed { .. } => 0.0,
            Self::Heuristic(h) => h.confidence,
            Self::Semantic(_) => {
                if self.detected() {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Queries to run for incremental retrieval
    pub fn gap_queries(&self) -> Vec<GapQuery> {
        match self {
            Self::Clear | Self::Failed { .. } => Vec::new(),
            Self::Heuristic(h) if h.detected => h
                .gaps
                .iter()
                .map(|gap| GapQuery::new(gap.clone(), format!("gap:{}", gap)))
                .collect(),
            Self::Heuristic(_) => Vec::new(),
            Self::Semantic(plan) => plan
                .enrichment_searches
                .iter()
                .map(|search| GapQuery::new(search.clone(), format!("enrichment:{}", search)))
                .collect(),
        }
    }

    /// Why evaluation failed, if it did
    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Entities the next structured lookup should return in featured form
    pub fn featured_entity_ids(&self) -> &[i64] {
        match self {
            Self::Semantic(plan) => &plan.entity_ids_to_feature,
            _ => &[],
        }
    }

    /// Reference -> reason map recorded on the context package
    pub fn gap_analysis(&self) -> BTreeMap<String, String> {
        let mut analysis = BTreeMap::new();
        match self {
            Self::Clear | Self::Failed { .. } => {}
            Self::Heuristic(h) => {
                for gap in &h.gaps {
                    let reason = if h.unmatched_entities.contains(gap) {
                        "unrecognized proper noun"
                    } else {
                        "reference outside baseline"
                    };
                    analysis.insert(gap.clone(), reason.to_string());
                }
            }
            Self::Semantic(plan) => {
                let reason = plan
                    .enrichment_reason
                    .clone()
                    .unwrap_or_else(|| "model-requested enrichment".to_string());
                for search in &plan.enrichment_searches {
                    analysis.insert(search.clone(), reason.clone());
                }
                for id in &plan.entity_ids_to_feature {
                    analysis.insert(format!("entity:{}", id), "feature entity".to_string());
                }
            }
        }
        analysis
    }
}

/// Common interface of both detectors
#[async_trait]
pub trait DivergenceDetection: Send + Sync {
    async fn detect(
        &self,
        user_input: &str,
        baseline: Option<&ContextPackage>,
        transition: Option<&PassTransition>,
    ) -> DivergenceResult;
}
