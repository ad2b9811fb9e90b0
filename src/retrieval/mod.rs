//! Incremental retrieval for pass 2
//!
//! Pulls extra chunks into the active context within the pass-2 budget,
//! either for detected gaps or, absent divergence, to extend the warm slice.

use crate::clients::RetrievalClient;
use crate::config::RetrievalConfig;
use crate::context::models::{BudgetComponent, Chunk};
use crate::context::state::ContextStateManager;
use crate::context::token_estimator::{TokenEstimator, WordBasedEstimator};
use crate::divergence::GapQuery;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on warm-slice expansion per pass
const MAX_WARM_EXPANSION: usize = 5;

/// Chunks registered by one retrieval call and their estimated cost
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalBatch {
    pub chunks: Vec<Chunk>,
    pub tokens: usize,
}

impl RetrievalBatch {
    pub fn chunk_ids(&self) -> Vec<i64> {
        self.chunks.iter().map(|c| c.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Budget-bounded retriever over a `RetrievalClient`
pub struct IncrementalRetriever {
    client: Arc<dyn RetrievalClient>,
    estimator: WordBasedEstimator,
    k: usize,
    hybrid: bool,
    tokens_per_warm_chunk: usize,
}

impl IncrementalRetriever {
    pub fn new(client: Arc<dyn RetrievalClient>, config: &RetrievalConfig) -> Self {
        Self {
            client,
            estimator: WordBasedEstimator::conservative(),
            k: config.incremental_k,
            hybrid: config.hybrid,
            tokens_per_warm_chunk: config.tokens_per_warm_chunk.max(1),
        }
    }

    /// Estimated token cost of a chunk
    pub fn chunk_cost(&self, chunk: &Chunk) -> usize {
        self.estimator.estimate(&chunk.text)
    }

    /// Retrieve chunks for each gap query in order until the budget runs out
    ///
    /// Results already present in the context are skipped. A failing query is
    /// logged and the next one is tried.
    pub async fn retrieve_incremental(
        &self,
        state: &mut ContextStateManager,
        gap_queries: &[GapQuery],
        token_budget: usize,
    ) -> RetrievalBatch {
        let mut batch = RetrievalBatch::default();

        'queries: for gap in gap_queries {
            if batch.tokens >= token_budget {
                break;
            }

            let results = match self.client.query_memory(&gap.query, self.k, self.hybrid).await {
                Ok(results) => results,
                Err(e) => {
                    warn!("Incremental query for {} failed: {}", gap.label, e);
                    continue;
                }
            };

            for chunk in results {
                if state.is_registered(chunk.id) {
                    continue;
                }
                let cost = self.chunk_cost(&chunk);
                if batch.tokens + cost > token_budget {
                    debug!(
                        "Chunk {} ({} tokens) exceeds remaining incremental budget",
                        chunk.id, cost
                    );
                    break 'queries;
                }

                let chunk = chunk.with_label(gap.label.clone());
                let added = state.register_additional_chunks(
                    vec![chunk.clone()],
                    BudgetComponent::Augmentation,
                    cost,
                    false,
                );
                if !added.is_empty() {
                    batch.tokens += cost;
                    batch.chunks.push(chunk);
                }
            }
        }

        info!(
            "Incremental retrieval: {} chunks, {} tokens from {} queries",
            batch.chunks.len(),
            batch.tokens,
            gap_queries.len()
        );
        batch
    }

    /// Default number of chunks to add when extending the warm slice
    pub fn default_expansion_limit(&self, token_budget: usize) -> usize {
        MAX_WARM_EXPANSION.min(token_budget / self.tokens_per_warm_chunk)
    }

    /// Extend the warm slice with the most recent unregistered chunks
    ///
    /// Returned chunks are in chronological order.
    pub async fn expand_warm_slice(
        &self,
        state: &mut ContextStateManager,
        token_budget: usize,
        limit: Option<usize>,
    ) -> RetrievalBatch {
        let limit = limit.unwrap_or_else(|| self.default_expansion_limit(token_budget));
        if limit == 0 {
            debug!("No room to extend the warm slice");
            return RetrievalBatch::default();
        }

        let known = state.all_chunk_ids().len();
        let recent = match self.client.get_recent_chunks(limit + known, None).await {
            Ok(recent) => recent,
            Err(e) => {
                warn!("Warm slice expansion failed: {}", e);
                return RetrievalBatch::default();
            }
        };

        let mut selected = Vec::new();
        let mut tokens = 0;
        for chunk in recent.into_iter().rev() {
            if selected.len() >= limit {
                break;
            }
            if state.is_registered(chunk.id) {
                continue;
            }
            let cost = self.chunk_cost(&chunk);
            if tokens + cost > token_budget {
                break;
            }
            tokens += cost;
            selected.push(chunk);
        }
        selected.reverse();

        let added = state.register_additional_chunks(
            selected.clone(),
            BudgetComponent::WarmSlice,
            tokens,
            true,
        );

        info!("Warm slice extended by {} chunks ({} tokens)", added.len(), tokens);
        RetrievalBatch {
            chunks: selected,
            tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::CollaboratorError;
    use crate::context::state::{ContextPackage, PassTransition};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeRetrieval {
        by_query: HashMap<String, Vec<Chunk>>,
        recent: Vec<Chunk>,
    }

    #[async_trait]
    impl RetrievalClient for FakeRetrieval {
        async fn query_memory(
            &self,
            query: &str,
            _k: usize,
            _hybrid: bool,
        ) -> Result<Vec<Chunk>, CollaboratorError> {
            self.by_query
                .get(query)
                .cloned()
                .ok_or_else(|| CollaboratorError::RequestFailed(query.to_string()))
        }

        async fn get_recent_chunks(
            &self,
            limit: usize,
            _before: Option<i64>,
        ) -> Result<Vec<Chunk>, CollaboratorError> {
            let skip = self.recent.len().saturating_sub(limit);
            Ok(self.recent[skip..].to_vec())
        }
    }

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    fn state_with_baseline(ids: &[i64], remaining: usize) -> ContextStateManager {
        let mut state = ContextStateManager::new();
        state.initialize_pass1(
            ContextPackage {
                baseline_chunk_ids: ids.iter().copied().collect(),
                ..Default::default()
            },
            PassTransition {
                remaining_budget: remaining,
                ..Default::default()
            },
            Vec::new(),
            Vec::new(),
            None,
        );
        state
    }

    fn retriever(client: FakeRetrieval) -> IncrementalRetriever {
        IncrementalRetriever::new(Arc::new(client), &RetrievalConfig::default())
    }

    #[tokio::test]
    async fn test_retrieve_skips_registered_and_labels() {
        let mut by_query = HashMap::new();
        by_query.insert(
            "lord vexmoor".to_string(),
            vec![Chunk::new(101, words(3)), Chunk::new(301, words(3))],
        );
        let retriever = retriever(FakeRetrieval {
            by_query,
            recent: vec![],
        });
        let mut state = state_with_baseline(&[101], 500);

        let batch = retriever
            .retrieve_incremental(
                &mut state,
                &[GapQuery::new("lord vexmoor", "gap:lord vexmoor")],
                500,
            )
            .await;

        assert_eq!(batch.chunk_ids(), vec![301]);
        assert_eq!(batch.tokens, 4);
        assert_eq!(batch.chunks[0].label.as_deref(), Some("gap:lord vexmoor"));
        assert_eq!(state.augmentations().len(), 1);
        assert_eq!(state.incremental_tokens(), 4);
    }

    #[tokio::test]
    async fn test_retrieve_stops_at_budget() {
        let mut by_query = HashMap::new();
        by_query.insert(
            "a".to_string(),
            vec![Chunk::new(1, words(30)), Chunk::new(2, words(30))],
        );
        by_query.insert("b".to_string(), vec![Chunk::new(3, words(3))]);
        let retriever = retriever(FakeRetrieval {
            by_query,
            recent: vec![],
        });
        let mut state = state_with_baseline(&[], 60);

        let batch = retriever
            .retrieve_incremental(
                &mut state,
                &[GapQuery::new("a", "gap:a"), GapQuery::new("b", "gap:b")],
                60,
            )
            .await;

        assert_eq!(batch.chunk_ids(), vec![1]);
        assert_eq!(batch.tokens, 40);
    }

    #[tokio::test]
    async fn test_failing_query_does_not_stop_others() {
        let mut by_query = HashMap::new();
        by_query.insert("b".to_string(), vec![Chunk::new(3, words(3))]);
        let retriever = retriever(FakeRetrieval {
            by_query,
            recent: vec![],
        });
        let mut state = state_with_baseline(&[], 100);

        let batch = retriever
            .retrieve_incremental(
                &mut state,
                &[GapQuery::new("missing", "gap:missing"), GapQuery::new("b", "gap:b")],
                100,
            )
            .await;
        assert_eq!(batch.chunk_ids(), vec![3]);
    }

    #[tokio::test]
    async fn test_expand_warm_slice_newest_unregistered() {
        let recent = (1..=8).map(|id| Chunk::new(id, words(3))).collect();
        let retriever = retriever(FakeRetrieval {
            by_query: HashMap::new(),
            recent,
        });
        let mut state = state_with_baseline(&[7, 8], 1000);

        let batch = retriever.expand_warm_slice(&mut state, 1000, Some(3)).await;

        assert_eq!(batch.chunk_ids(), vec![4, 5, 6]);
        assert_eq!(state.warm_slice().len(), 3);
        assert!(state.augmentations().is_empty());
        assert_eq!(state.component_usage(BudgetComponent::WarmSlice), 12);
    }

    #[tokio::test]
    async fn test_default_expansion_limit() {
        let retriever = retriever(FakeRetrieval {
            by_query: HashMap::new(),
            recent: vec![],
        });
        assert_eq!(retriever.default_expansion_limit(10_000), 5);
        assert_eq!(retriever.default_expansion_limit(300), 2);
        assert_eq!(retriever.default_expansion_limit(100), 0);

        let mut state = state_with_baseline(&[], 100);
        assert!(retriever.expand_warm_slice(&mut state, 100, None).await.is_empty());
    }
}
