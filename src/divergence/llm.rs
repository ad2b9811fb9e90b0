//! Model-driven divergence detection
//!
//! Asks a structured model which searches and entities would enrich the next
//! response. Every failure path degrades to `DivergenceResult::Failed`, which
//! callers treat as no divergence.

use super::json_extract::extract_json_object;
use super::{DivergenceDetection, DivergenceResult, EnrichmentPlan};
use crate::config::DivergenceConfig;
use crate::context::state::{ContextPackage, PassTransition};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Characters of prior narrative included in the prompt
const NARRATIVE_TAIL_CHARS: usize = 2000;

const SYSTEM_PROMPT: &str = "You decide whether a reader's message needs extra background \
    before the story continues. Answer with a single JSON object and nothing else: \
    {\"enrichmentSearches\": [string], \"entityIdsToFeature\": [int], \"enrichmentReason\": string|null}. \
    Use empty lists when the current context already covers the message.";

/// Structured model errors
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Empty completion")]
    EmptyCompletion,
}

/// A model that answers a prompt with free-form text
#[async_trait]
pub trait StructuredModel: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ModelError>;
}

/// Semantic detector backed by a `StructuredModel`
pub struct LlmDivergenceDetector {
    model: Arc<dyn StructuredModel>,
    max_searches: usize,
}

impl LlmDivergenceDetector {
    pub fn new(model: Arc<dyn StructuredModel>, config: &DivergenceConfig) -> Self {
        Self {
            model,
            max_searches: config.llm_max_searches,
        }
    }

    fn build_prompt(
        &self,
        user_input: &str,
        baseline: &ContextPackage,
        transition: &PassTransition,
    ) -> String {
        let narrative = &transition.prior_narrative_text;
        let tail_start = narrative
            .char_indices()
            .rev()
            .nth(NARRATIVE_TAIL_CHARS.saturating_sub(1))
            .map_or(0, |(idx, _)| idx);

        let entities: Vec<String> = baseline
            .baseline_entities
            .iter()
            .map(|(name, entity)| format!("{} (id {}, {})", name, entity.id, entity.kind.as_str()))
            .collect();

        format!(
            "Known entities: {}\nBaseline themes: {}\nExpected themes: {}\n\n\
            Recent narrative:\n{}\n\nReader's message:\n{}\n\n\
            Suggest at most {} searches.",
            if entities.is_empty() { "none".to_string() } else { entities.join("; ") },
            baseline.baseline_themes.join(", "),
            transition.expected_user_themes.join(", "),
            &narrative[tail_start..],
            user_input,
            self.max_searches
        )
    }

    /// Trim, dedupe, and cap the model's suggestions
    fn sanitize(&self, mut plan: EnrichmentPlan) -> EnrichmentPlan {
        let mut seen = HashSet::new();
        plan.enrichment_searches = plan
            .enrichment_searches
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
            .take(self.max_searches)
            .collect();

        let mut seen_ids = HashSet::new();
        plan.entity_ids_to_feature.retain(|id| seen_ids.insert(*id));

        plan.enrichment_reason = plan
            .enrichment_reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        plan
    }
}

#[async_trait]
impl DivergenceDetection for LlmDivergenceDetector {
    async fn detect(
        &self,
        user_input: &str,
        baseline: Option<&ContextPackage>,
        transition: Option<&PassTransition>,
    ) -> DivergenceResult {
        let (Some(baseline), Some(transition)) = (baseline, transition) else {
            return DivergenceResult::Clear;
        };
        if user_input.trim().is_empty() {
            return DivergenceResult::Clear;
        }

        let prompt = self.build_prompt(user_input, baseline, transition);
        let completion = match self.model.complete(SYSTEM_PROMPT, &prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Enrichment call failed, treating as no divergence: {}", e);
                return DivergenceResult::Failed {
                    reason: format!("enrichment call failed: {}", e),
                };
            }
        };

        let Some(plan) = extract_json_object::<EnrichmentPlan>(&completion) else {
            warn!(
                "No enrichment plan in model output ({} chars), treating as no divergence",
                completion.len()
            );
            return DivergenceResult::Failed {
                reason: "no enrichment plan in model output".to_string(),
            };
        };

        let plan = self.sanitize(plan);
        debug!(
            "Enrichment plan: {} searches, {} featured entities",
            plan.enrichment_searches.len(),
            plan.entity_ids_to_feature.len()
        );
        DivergenceResult::Semantic(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CannedModel {
        reply: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedModel {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err("connection refused".to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StructuredModel for CannedModel {
        async fn complete(&self, _system: &str, prompt: &str) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone().map_err(ModelError::Network)
        }
    }

    fn context() -> (ContextPackage, PassTransition) {
        let transition = PassTransition {
            prior_narrative_text: "The lanterns guttered.".into(),
            ..Default::default()
        };
        (ContextPackage::default(), transition)
    }

    #[tokio::test]
    async fn test_plan_parsed_from_prose() {
        let model = CannedModel::replying(
            "Here is my answer: {\"enrichmentSearches\": [\"Iron Keep\", \" iron keep \", \"\", \"warden\"], \
             \"entityIdsToFeature\": [7, 7, 9], \"enrichmentReason\": \"new location\"} hope that helps",
        );
        let detector = LlmDivergenceDetector::new(model.clone(), &DivergenceConfig::default());
        let (package, transition) = context();

        let result = detector
            .detect("Tell me about the Iron Keep", Some(&package), Some(&transition))
            .await;

        assert!(result.detected());
        assert_eq!(result.confidence(), 1.0);
        let DivergenceResult::Semantic(plan) = &result else {
            panic!("expected semantic result");
        };
        assert_eq!(plan.enrichment_searches, vec!["Iron Keep", "warden"]);
        assert_eq!(plan.entity_ids_to_feature, vec![7, 9]);
        assert_eq!(plan.enrichment_reason.as_deref(), Some("new location"));
        assert!(model.prompts.lock().unwrap()[0].contains("Tell me about the Iron Keep"));
    }

    #[tokio::test]
    async fn test_searches_capped() {
        let model = CannedModel::replying(r#"{"enrichmentSearches": ["a", "b", "c", "d", "e"]}"#);
        let detector = LlmDivergenceDetector::new(model, &DivergenceConfig::default());
        let (package, transition) = context();

        let result = detector.detect("hello", Some(&package), Some(&transition)).await;
        assert_eq!(result.gap_queries().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_plan_not_detected() {
        let model = CannedModel::replying(r#"{"enrichmentSearches": [], "entityIdsToFeature": []}"#);
        let detector = LlmDivergenceDetector::new(model, &DivergenceConfig::default());
        let (package, transition) = context();

        let result = detector.detect("hello", Some(&package), Some(&transition)).await;
        assert!(!result.detected());
        assert_eq!(result.confidence(), 0.0);
    }

    #[tokio::test]
    async fn test_unparseable_output_fails_soft() {
        let model = CannedModel::replying("I cannot answer that { properly");
        let detector = LlmDivergenceDetector::new(model, &DivergenceConfig::default());
        let (package, transition) = context();

        let result = detector.detect("hello", Some(&package), Some(&transition)).await;
        assert!(!result.detected());
        assert_eq!(result.failure(), Some("no enrichment plan in model output"));
    }

    #[tokio::test]
    async fn test_call_error_fails_soft() {
        let detector =
            LlmDivergenceDetector::new(CannedModel::failing(), &DivergenceConfig::default());
        let (package, transition) = context();

        let result = detector.detect("hello", Some(&package), Some(&transition)).await;
        assert!(!result.detected());
        assert!(result.failure().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_no_baseline_skips_model() {
        let model = CannedModel::replying(r#"{"enrichmentSearches": ["x"]}"#);
        let detector = LlmDivergenceDetector::new(model.clone(), &DivergenceConfig::default());

        let result = detector.detect("hello", None, None).await;
        assert_eq!(result, DivergenceResult::Clear);
        assert!(model.prompts.lock().unwrap().is_empty());
    }
}
