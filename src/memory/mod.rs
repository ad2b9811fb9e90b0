//! Dual-pass memory subsystem
//!
//! Pass 1 commits a baseline after each generated turn. Pass 2 runs on the
//! next user input: it checks the input against that baseline and retrieves
//! only what is missing, within the budget the baseline left over.

use crate::context::models::{Chunk, EntityData, NarrativeAnalysis, TokenUsage};
use crate::context::query_memory::{Pass, QueryMemory};
use crate::context::state::{ContextPackage, ContextState, ContextStateManager, ContextSummary, PassTransition};
use crate::context::token_budget::{IncrementalReserve, TokenBudgetManager};
use crate::divergence::{DivergenceDetection, DivergenceResult, GapQuery};
use crate::retrieval::{IncrementalRetriever, RetrievalBatch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Retrieved passage as recorded in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPassage {
    pub chunk_id: i64,
    pub score: f32,
    pub label: Option<String>,
}

/// Serializable record of a committed baseline, handed to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub turn_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub baseline_chunk_ids: Vec<i64>,
    pub themes: Vec<String>,
    pub expected_user_themes: Vec<String>,
    pub remaining_budget: usize,
    pub authorial_directives: Vec<String>,
    pub structured_passages: Vec<SnapshotPassage>,
}

/// Everything pass 1 needs to commit a baseline
#[derive(Debug, Clone, Default)]
pub struct BaselineInput {
    pub turn_id: Uuid,
    pub narrative: String,
    pub warm_slice: Vec<Chunk>,
    pub retrieved: Vec<Chunk>,
    pub analysis: Option<NarrativeAnalysis>,
    pub entity_data: EntityData,
    pub token_usage: TokenUsage,
    pub assembled_context: serde_json::Value,
    /// Deep queries issued while building this baseline
    pub queries: Vec<String>,
}

/// Result of one pass-2 cycle
#[derive(Debug, Clone)]
pub struct Pass2Outcome {
    pub divergence: DivergenceResult,
    pub batch: RetrievalBatch,
    /// True when the warm slice was extended instead of gap retrieval
    pub warm_expansion: bool,
    pub tokens_consumed: usize,
    pub remaining_budget: usize,
    /// Gap queries dropped as repeats or over the iteration cap
    pub skipped_queries: Vec<String>,
}

impl Pass2Outcome {
    fn skipped() -> Self {
        Self {
            divergence: DivergenceResult::Clear,
            batch: RetrievalBatch::default(),
            warm_expansion: false,
            tokens_consumed: 0,
            remaining_budget: 0,
            skipped_queries: Vec::new(),
        }
    }

    pub fn new_chunk_ids(&self) -> Vec<i64> {
        self.batch.chunk_ids()
    }
}

/// Owns the cross-turn baseline and the pass-2 pipeline
pub struct DualPassMemory {
    state: ContextStateManager,
    queries: QueryMemory,
    detector: Arc<dyn DivergenceDetection>,
    retriever: IncrementalRetriever,
    budget_manager: Arc<TokenBudgetManager>,
    featured_ids: Vec<i64>,
}

impl DualPassMemory {
    pub fn new(
        detector: Arc<dyn DivergenceDetection>,
        retriever: IncrementalRetriever,
        budget_manager: Arc<TokenBudgetManager>,
        max_iterations: usize,
    ) -> Self {
        Self {
            state: ContextStateManager::new(),
            queries: QueryMemory::new(max_iterations),
            detector,
            retriever,
            budget_manager,
            featured_ids: Vec::new(),
        }
    }

    /// Run pass 2 against the active baseline
    pub async fn process_user_input(&mut self, user_input: &str) -> Pass2Outcome {
        if self.state.state() == ContextState::Empty {
            debug!("No baseline yet; skipping pass 2");
            return Pass2Outcome::skipped();
        }

        self.queries.reset(Pass::Incremental);

        let divergence = self
            .detector
            .detect(user_input, self.state.package(), self.state.transition())
            .await;
        self.state.record_divergence(
            divergence.detected(),
            divergence.confidence(),
            divergence.gap_analysis(),
        );
        self.featured_ids = divergence.featured_entity_ids().to_vec();

        let budget = self.state.remaining_budget();
        let mut skipped_queries = Vec::new();
        let (batch, warm_expansion) = if divergence.detected() {
            let mut to_run: Vec<GapQuery> = Vec::new();
            for gap in divergence.gap_queries() {
                if self.queries.has_run(&gap.query) || !self.queries.record(Pass::Incremental, &gap.query) {
                    skipped_queries.push(gap.query);
                    continue;
                }
                to_run.push(gap);
            }
            let batch = self
                .retriever
                .retrieve_incremental(&mut self.state, &to_run, budget)
                .await;
            (batch, false)
        } else {
            let batch = self.retriever.expand_warm_slice(&mut self.state, budget, None).await;
            (batch, true)
        };

        let tokens_consumed = self.state.consume_budget(batch.tokens);
        let remaining_budget = self.state.remaining_budget();

        info!(
            "Pass 2: detected={} confidence={:.2} new_chunks={} consumed={} remaining={}",
            divergence.detected(),
            divergence.confidence(),
            batch.chunks.len(),
            tokens_consumed,
            remaining_budget
        );

        Pass2Outcome {
            divergence,
            batch,
            warm_expansion,
            tokens_consumed,
            remaining_budget,
            skipped_queries,
        }
    }

    /// Commit a new baseline for the next turn's pass 2
    pub fn commit_baseline(&mut self, input: BaselineInput) -> BaselineSnapshot {
        let BaselineInput {
            turn_id,
            narrative,
            warm_slice,
            retrieved,
            analysis,
            entity_data,
            token_usage,
            assembled_context,
            queries,
        } = input;

        let baseline_chunk_ids = warm_slice
            .iter()
            .chain(retrieved.iter())
            .map(|c| c.id)
            .collect();
        let reserve = self.reserve_for(&token_usage);
        let (themes, expected_user_themes, authorial_directives) = analysis
            .as_ref()
            .map(|a| {
                (
                    a.themes.clone(),
                    a.expected_user_themes.clone(),
                    a.authorial_directives.clone(),
                )
            })
            .unwrap_or_default();

        let package = ContextPackage {
            baseline_chunk_ids,
            baseline_entities: entity_data.entity_refs(),
            baseline_themes: themes.clone(),
            token_usage,
            ..Default::default()
        };
        let transition = PassTransition {
            prior_narrative_text: narrative,
            expected_user_themes: expected_user_themes.clone(),
            assembled_context,
            remaining_budget: reserve.remaining,
        };

        let snapshot = BaselineSnapshot {
            turn_id,
            created_at: Utc::now(),
            baseline_chunk_ids: package.baseline_chunk_ids.iter().copied().collect(),
            themes,
            expected_user_themes,
            remaining_budget: reserve.remaining,
            authorial_directives,
            structured_passages: retrieved
                .iter()
                .map(|c| SnapshotPassage {
                    chunk_id: c.id,
                    score: c.score,
                    label: c.label.clone(),
                })
                .collect(),
        };

        self.state
            .initialize_pass1(package, transition, warm_slice, retrieved, analysis);

        self.queries.reset(Pass::Baseline);
        self.queries.reset(Pass::Incremental);
        for query in &queries {
            self.queries.record(Pass::Baseline, query);
        }
        self.featured_ids.clear();

        snapshot
    }

    fn reserve_for(&self, usage: &TokenUsage) -> IncrementalReserve {
        self.budget_manager
            .incremental_reserve(usage.total_available, usage.content_tokens())
    }

    /// Drop the baseline; used when generation fails outright
    pub fn reset(&mut self) {
        self.state.reset();
        self.queries.reset(Pass::Baseline);
        self.queries.reset(Pass::Incremental);
        self.featured_ids.clear();
    }

    /// Entity ids the last pass 2 asked to feature
    pub fn featured_entity_ids(&self) -> &[i64] {
        &self.featured_ids
    }

    pub fn state(&self) -> &ContextStateManager {
        &self.state
    }

    pub fn query_memory(&self) -> &QueryMemory {
        &self.queries
    }

    pub fn summary(&self) -> ContextSummary {
        self.state.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{CollaboratorError, RetrievalClient};
    use crate::config::{DivergenceConfig, RetrievalConfig, TokenBudgetConfig};
    use crate::divergence::HeuristicDivergenceDetector;
    use async_trait::async_trait;

    struct StaticRetrieval;

    #[async_trait]
    impl RetrievalClient for StaticRetrieval {
        async fn query_memory(
            &self,
            query: &str,
            _k: usize,
            _hybrid: bool,
        ) -> Result<Vec<Chunk>, CollaboratorError> {
            Ok(vec![Chunk::new(300, format!("{} was last seen near the docks", query))])
        }

        async fn get_recent_chunks(
            &self,
            limit: usize,
            _before: Option<i64>,
        ) -> Result<Vec<Chunk>, CollaboratorError> {
            let chunks: Vec<Chunk> = (95..=102).map(|id| Chunk::new(id, "rain fell")).collect();
            let skip = chunks.len().saturating_sub(limit);
            Ok(chunks[skip..].to_vec())
        }
    }

    fn memory() -> DualPassMemory {
        let budget_manager = Arc::new(
            TokenBudgetManager::new(TokenBudgetConfig {
                apex_window: Some(32_000),
                ..Default::default()
            })
            .unwrap(),
        );
        DualPassMemory::new(
            Arc::new(HeuristicDivergenceDetector::new(&DivergenceConfig::default())),
            IncrementalRetriever::new(Arc::new(StaticRetrieval), &RetrievalConfig::default()),
            budget_manager,
            5,
        )
    }

    fn baseline_input() -> BaselineInput {
        BaselineInput {
            narrative: "Mira Kestrel counted the crates twice.".into(),
            warm_slice: vec![Chunk::new(101, "a"), Chunk::new(102, "b")],
            retrieved: vec![Chunk::new(201, "c").with_score(0.8)],
            analysis: Some(NarrativeAnalysis {
                themes: vec!["smuggling".into()],
                expected_user_themes: vec!["bargain".into()],
                authorial_directives: vec!["keep it tense".into()],
                ..Default::default()
            }),
            token_usage: TokenUsage {
                total_available: 1200,
                warm_slice: 360,
                structured: 180,
                augmentation: 90,
            },
            queries: vec!["crate manifest".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pass2_skipped_without_baseline() {
        let mut memory = memory();
        let outcome = memory.process_user_input("Who is Lord Vexmoor?").await;
        assert!(!outcome.divergence.detected());
        assert_eq!(outcome.tokens_consumed, 0);
        assert_eq!(memory.state().state(), ContextState::Empty);
    }

    #[tokio::test]
    async fn test_commit_baseline_snapshot() {
        let mut memory = memory();
        let snapshot = memory.commit_baseline(baseline_input());

        assert_eq!(snapshot.baseline_chunk_ids, vec![101, 102, 201]);
        assert_eq!(snapshot.remaining_budget, 570);
        assert_eq!(snapshot.themes, vec!["smuggling"]);
        assert_eq!(snapshot.authorial_directives, vec!["keep it tense"]);
        assert_eq!(snapshot.structured_passages[0].chunk_id, 201);
        assert_eq!(memory.state().state(), ContextState::BaselineActive);
        assert!(memory.query_memory().has_run("Crate Manifest "));
    }

    #[tokio::test]
    async fn test_divergent_input_retrieves_and_consumes() {
        let mut memory = memory();
        memory.commit_baseline(baseline_input());

        let outcome = memory.process_user_input("Where is Lord Vexmoor hiding?").await;

        assert!(outcome.divergence.detected());
        assert!(!outcome.warm_expansion);
        assert_eq!(outcome.new_chunk_ids(), vec![300]);
        assert!(outcome.tokens_consumed > 0);
        assert_eq!(outcome.remaining_budget, 570 - outcome.tokens_consumed);
        assert!(memory.state().package().unwrap().additional_chunk_ids.contains(&300));
        assert_eq!(
            memory.state().state(),
            ContextState::BaselineActiveWithIncrement
        );
    }

    #[tokio::test]
    async fn test_quiet_input_extends_warm_slice() {
        let mut memory = memory();
        memory.commit_baseline(baseline_input());

        let outcome = memory.process_user_input("smuggling bargain").await;

        assert!(!outcome.divergence.detected());
        assert!(outcome.warm_expansion);
        assert_eq!(outcome.new_chunk_ids(), vec![98, 99, 100]);
        assert_eq!(outcome.tokens_consumed, 9);
    }

    #[tokio::test]
    async fn test_reset_clears_baseline() {
        let mut memory = memory();
        memory.commit_baseline(baseline_input());
        memory.reset();
        assert_eq!(memory.state().state(), ContextState::Empty);
        assert!(!memory.query_memory().has_run("crate manifest"));
    }
}
