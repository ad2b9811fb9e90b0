//! Turn cycle manager
//!
//! Runs USER_INPUT → WARM_ANALYSIS → ENTITY_STATE → DEEP_QUERIES →
//! PAYLOAD_ASSEMBLY → APEX_GENERATION → INTEGRATION. Shared memory state is
//! only written in USER_INPUT (pass 2) and INTEGRATION (pass 1), so a turn
//! abandoned between phases leaves nothing half-committed.

use super::assembly::fit_payload;
use super::{
    ContextPayload, GenerationFailure, GenerationOutcome, Pass2Summary, PayloadMetadata,
    TurnContext, TurnOutcome, TurnPhase, TurnRequest,
};
use crate::clients::{
    EntityQuery, EntityStore, LocalInference, NarrativeGenerator, QueryClassifier, QueryType,
    RetrievalClient, SnapshotSink, StoreError,
};
use crate::config::Config;
use crate::context::models::{Chunk, EntityKind, EntityRecord, NarrativeAnalysis, TieredEntities};
use crate::context::token_budget::TokenBudgetManager;
use crate::divergence::{DivergenceDetection, HeuristicDivergenceDetector};
use crate::error::{ContextError, Result};
use crate::memory::{BaselineInput, BaselineSnapshot, DualPassMemory};
use crate::metrics::TurnMetrics;
use crate::retrieval::IncrementalRetriever;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use prometheus::HistogramTimer;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Drives one turn at a time through every phase
pub struct TurnCycleManager {
    config: Config,
    budget_manager: Arc<TokenBudgetManager>,
    retrieval: Arc<dyn RetrievalClient>,
    entity_store: Arc<dyn EntityStore>,
    inference: Option<Arc<dyn LocalInference>>,
    generator: Option<Arc<dyn NarrativeGenerator>>,
    classifier: Option<Arc<dyn QueryClassifier>>,
    snapshot_sink: Option<Arc<dyn SnapshotSink>>,
    memory: Option<DualPassMemory>,
    metrics: Option<Arc<TurnMetrics>>,
}

impl TurnCycleManager {
    /// Create a manager; invalid configuration is fatal
    pub fn new(
        config: Config,
        retrieval: Arc<dyn RetrievalClient>,
        entity_store: Arc<dyn EntityStore>,
    ) -> Result<Self> {
        config.validate()?;
        let budget_manager = Arc::new(TokenBudgetManager::new(config.token_budget.clone())?);

        Ok(Self {
            config,
            budget_manager,
            retrieval,
            entity_store,
            inference: None,
            generator: None,
            classifier: None,
            snapshot_sink: None,
            memory: None,
            metrics: None,
        })
    }

    /// Replace the budget manager, e.g. to use a different estimator
    pub fn with_budget_manager(mut self, budget_manager: Arc<TokenBudgetManager>) -> Self {
        self.budget_manager = budget_manager;
        self
    }

    pub fn with_inference(mut self, inference: Arc<dyn LocalInference>) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn NarrativeGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn QueryClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshot_sink = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<TurnMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enable dual-pass memory with the given detector
    pub fn with_detector(mut self, detector: Arc<dyn DivergenceDetection>) -> Self {
        let retriever = IncrementalRetriever::new(Arc::clone(&self.retrieval), &self.config.retrieval);
        self.memory = Some(DualPassMemory::new(
            detector,
            retriever,
            Arc::clone(&self.budget_manager),
            self.config.query_memory.max_iterations,
        ));
        self
    }

    /// Enable dual-pass memory with the heuristic detector
    pub fn with_heuristic_memory(self) -> Self {
        let detector = Arc::new(HeuristicDivergenceDetector::new(&self.config.divergence));
        self.with_detector(detector)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn budget_manager(&self) -> &TokenBudgetManager {
        &self.budget_manager
    }

    pub fn memory(&self) -> Option<&DualPassMemory> {
        self.memory.as_ref()
    }

    /// Run one full turn
    ///
    /// Fatal failures return `Err`; every other failure is listed in the
    /// outcome's error log.
    pub async fn run_turn(&mut self, request: TurnRequest) -> Result<TurnOutcome> {
        let mut ctx = TurnContext::new(request);
        info!(
            "Starting turn {} for model {}",
            ctx.turn_id, ctx.request.model_id
        );

        match self.run_phases(&mut ctx).await {
            Ok(outcome) => {
                let label = if outcome.generation.is_success() {
                    "completed"
                } else {
                    "generation_failed"
                };
                if let Some(metrics) = &self.metrics {
                    metrics.record_turn(label);
                }
                info!(
                    "Turn {} finished: {} with {} recorded errors",
                    outcome.turn_id,
                    label,
                    outcome.errors.len()
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    "Turn {} aborted in {} ({:?}): {}",
                    ctx.turn_id,
                    ctx.phase,
                    e.category(),
                    e
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_turn("aborted");
                }
                Err(e)
            }
        }
    }

    async fn run_phases(&mut self, ctx: &mut TurnContext) -> Result<TurnOutcome> {
        let timer = self.phase_timer(TurnPhase::UserInput);
        self.user_input(ctx).await?;
        self.finish_phase(ctx, timer);

        let timer = self.phase_timer(TurnPhase::WarmAnalysis);
        self.warm_analysis(ctx).await?;
        self.finish_phase(ctx, timer);

        let timer = self.phase_timer(TurnPhase::EntityState);
        self.entity_state(ctx).await;
        self.finish_phase(ctx, timer);

        let timer = self.phase_timer(TurnPhase::DeepQueries);
        self.deep_queries(ctx).await?;
        self.finish_phase(ctx, timer);

        let timer = self.phase_timer(TurnPhase::PayloadAssembly);
        let payload = self.payload_assembly(ctx);
        self.finish_phase(ctx, timer);

        let timer = self.phase_timer(TurnPhase::ApexGeneration);
        let generation = self.apex_generation(&payload).await;
        ctx.payload = Some(payload);
        self.finish_phase(ctx, timer);

        let timer = self.phase_timer(TurnPhase::Integration);
        let snapshot = self.integration(ctx, &generation).await;
        self.finish_phase(ctx, timer);

        Ok(TurnOutcome {
            turn_id: ctx.turn_id,
            generation,
            token_usage: ctx.token_usage,
            pass2: ctx.pass2.clone(),
            snapshot,
            phases: ctx.completed.clone(),
            errors: ctx.errors.clone(),
        })
    }

    fn phase_timer(&self, phase: TurnPhase) -> Option<HistogramTimer> {
        self.metrics.as_ref().map(|m| m.phase_timer(phase.as_str()))
    }

    fn finish_phase(&self, ctx: &mut TurnContext, timer: Option<HistogramTimer>) {
        if let Some(timer) = timer {
            timer.observe_duration();
        }
        debug!("Turn {} completed phase {}", ctx.turn_id, ctx.phase);
        ctx.complete_phase();
    }

    /// Budget the turn and run pass 2 against the previous baseline
    async fn user_input(&mut self, ctx: &mut TurnContext) -> Result<()> {
        let budget = self
            .budget_manager
            .calculate_budget(&ctx.request.user_input, &ctx.request.model_id)?;
        ctx.token_usage.total_available = budget.total_available;
        ctx.budget = budget;

        let Some(memory) = self.memory.as_mut() else {
            return Ok(());
        };

        let outcome = memory.process_user_input(&ctx.request.user_input).await;
        let state = memory.state();
        ctx.augmentations = state.augmentations().to_vec();
        ctx.warm_slice = state.warm_expansions().to_vec();
        ctx.featured_ids = memory.featured_entity_ids().to_vec();

        if let Some(metrics) = &self.metrics {
            metrics.record_pass2(outcome.divergence.detected(), outcome.tokens_consumed);
        }
        if let Some(reason) = outcome.divergence.failure() {
            ctx.record_error(&ContextError::Enrichment(reason.to_string()));
        }

        ctx.pass2 = Some(Pass2Summary {
            divergence_detected: outcome.divergence.detected(),
            confidence: outcome.divergence.confidence(),
            new_chunk_ids: outcome.new_chunk_ids(),
            tokens_consumed: outcome.tokens_consumed,
            remaining_budget: outcome.remaining_budget,
            warm_expansion: outcome.warm_expansion,
        });
        Ok(())
    }

    async fn require_inference(&self) -> Result<Arc<dyn LocalInference>> {
        let inference = self
            .inference
            .as_ref()
            .ok_or_else(|| ContextError::Semantic("local inference is not configured".to_string()))?;
        if !inference.is_available().await {
            return Err(ContextError::Semantic(
                "local inference is unavailable".to_string(),
            ));
        }
        Ok(Arc::clone(inference))
    }

    /// Assemble the warm slice and analyze it; both are required
    async fn warm_analysis(&self, ctx: &mut TurnContext) -> Result<()> {
        let inference = self.require_inference().await?;

        let recent = match self
            .retrieval
            .get_recent_chunks(self.config.retrieval.warm_slice_size, ctx.request.continuation_from)
            .await
        {
            Ok(recent) => recent,
            Err(e) => {
                warn!("Recent chunk lookup failed: {}", e);
                Vec::new()
            }
        };

        // Pass-2 expansions were parked on the context during USER_INPUT
        let mut warm: IndexMap<i64, Chunk> = IndexMap::new();
        for chunk in recent.into_iter().chain(std::mem::take(&mut ctx.warm_slice)) {
            warm.entry(chunk.id).or_insert(chunk);
        }
        let mut warm: Vec<Chunk> = warm.into_values().collect();
        warm.sort_by_key(|c| c.id);

        if warm.is_empty() {
            return Err(ContextError::Semantic("warm slice is empty".to_string()));
        }

        let analysis = inference
            .analyze_narrative_context(&warm, &ctx.request.user_input)
            .await
            .map_err(|e| ContextError::Semantic(format!("narrative analysis failed: {}", e)))?;

        debug!(
            "Warm analysis over {} chunks: {} themes, {} mentioned entities",
            warm.len(),
            analysis.themes.len(),
            analysis.entities_mentioned.len()
        );
        ctx.warm_slice = warm;
        ctx.analysis = analysis;
        Ok(())
    }

    async fn lookup(&self, query: EntityQuery) -> std::result::Result<Vec<EntityRecord>, StoreError> {
        self.entity_store.lookup(&query).await
    }

    /// Turn a lookup result into records, degrading failures to empty
    fn settle(
        &self,
        ctx: &mut TurnContext,
        kind: EntityKind,
        result: std::result::Result<Vec<EntityRecord>, StoreError>,
    ) -> Vec<EntityRecord> {
        match result {
            Ok(records) => records,
            Err(e) => {
                match &e {
                    StoreError::MissingTable(table) => {
                        info!("No {} table ({}); continuing without {}", kind.as_str(), table, kind.as_str())
                    }
                    StoreError::Query(_) => warn!("{} lookup failed: {}", kind.as_str(), e),
                }
                ctx.record_error(&ContextError::Degraded(format!("{}: {}", kind.as_str(), e)));
                if let Some(metrics) = &self.metrics {
                    metrics.record_degraded_query(kind.as_str());
                }
                Vec::new()
            }
        }
    }

    /// Structured world state; every lookup is allowed to degrade
    async fn entity_state(&self, ctx: &mut TurnContext) {
        let text = lookup_text(&ctx.request.user_input, &ctx.analysis);
        let featured = ctx.featured_ids.clone();
        let statuses = &self.config.entity_state;

        let (characters, places, factions, events, threats) = futures::join!(
            self.lookup(EntityQuery::new(EntityKind::Character, text.clone()).with_featured(&featured)),
            self.lookup(EntityQuery::new(EntityKind::Place, text.clone()).with_featured(&featured)),
            self.lookup(EntityQuery::new(EntityKind::Faction, text.clone()).with_featured(&featured)),
            self.lookup(
                EntityQuery::new(EntityKind::Event, text.clone())
                    .with_statuses(&statuses.event_statuses)
                    .with_featured(&featured)
            ),
            self.lookup(
                EntityQuery::new(EntityKind::Threat, text.clone())
                    .with_statuses(&statuses.threat_statuses)
                    .with_featured(&featured)
            ),
        );

        let characters = self.settle(ctx, EntityKind::Character, characters);
        let places = self.settle(ctx, EntityKind::Place, places);
        let factions = self.settle(ctx, EntityKind::Faction, factions);
        let events = self.settle(ctx, EntityKind::Event, events);
        let threats = self.settle(ctx, EntityKind::Threat, threats);

        ctx.entity_data.characters = TieredEntities::from_records(characters);
        ctx.entity_data.places = TieredEntities::from_records(places);
        ctx.entity_data.factions = TieredEntities::from_records(factions);
        ctx.entity_data.events = events.into_iter().map(EntityRecord::into_featured).collect();
        ctx.entity_data.threats = threats.into_iter().map(EntityRecord::into_featured).collect();

        let featured_characters = ctx.entity_data.featured_character_ids();
        if !featured_characters.is_empty() {
            let query = EntityQuery::new(EntityKind::Relationship, text).related_to(featured_characters);
            let relationships = self.lookup(query).await;
            let relationships = self.settle(ctx, EntityKind::Relationship, relationships);
            ctx.entity_data.relationships = relationships
                .into_iter()
                .map(EntityRecord::into_featured)
                .collect();
        }

        info!(
            "Entity state: {} records ({} baseline)",
            ctx.entity_data.record_count(),
            ctx.entity_data.baseline_records().count()
        );
    }

    async fn classify(&self, query: &str) -> QueryType {
        let Some(classifier) = &self.classifier else {
            return QueryType::Generic;
        };
        match classifier.classify(query).await {
            Ok(query_type) => query_type,
            Err(e) => {
                debug!("Query classification failed, using generic: {}", e);
                QueryType::Generic
            }
        }
    }

    /// Generate, classify, and run deep retrieval queries
    async fn deep_queries(&self, ctx: &mut TurnContext) -> Result<()> {
        let inference = self.require_inference().await?;
        let generated = inference
            .generate_retrieval_queries(&ctx.analysis, &ctx.request.user_input)
            .await
            .map_err(|e| ContextError::Semantic(format!("query generation failed: {}", e)))?;

        let queries = cap_queries(generated, self.config.retrieval.max_deep_queries);
        if queries.is_empty() {
            return Err(ContextError::Semantic(
                "no retrieval queries were generated".to_string(),
            ));
        }

        let k = self.config.retrieval.deep_query_k;
        let results: Vec<Vec<Chunk>> = stream::iter(queries.iter().cloned())
            .map(|query| async move {
                let query_type = self.classify(&query).await;
                let hybrid = self.config.retrieval.hybrid && query_type.prefers_hybrid();
                match self.retrieval.query_memory(&query, k, hybrid).await {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        warn!("Deep query ({}) failed: {}", query_type.as_str(), e);
                        Vec::new()
                    }
                }
            })
            .buffer_unordered(self.config.retrieval.max_concurrency)
            .collect()
            .await;

        let warm_ids: HashSet<i64> = ctx.warm_slice.iter().map(|c| c.id).collect();
        ctx.retrieved = dedupe_passages(
            results.into_iter().flatten(),
            &warm_ids,
            self.config.retrieval.max_passages,
        );
        ctx.deep_queries = queries;

        info!(
            "Deep queries: {} queries, {} passages retained",
            ctx.deep_queries.len(),
            ctx.retrieved.len()
        );
        Ok(())
    }

    /// Fit everything to the budget and build the generation payload
    fn payload_assembly(&self, ctx: &mut TurnContext) -> ContextPayload {
        let mut passages = ctx.retrieved.clone();
        let retrieved_ids: HashSet<i64> = passages.iter().map(|c| c.id).collect();
        passages.extend(
            ctx.augmentations
                .iter()
                .filter(|c| !retrieved_ids.contains(&c.id))
                .cloned(),
        );

        let fitted = fit_payload(
            &self.budget_manager,
            &ctx.budget,
            ctx.warm_slice.clone(),
            &ctx.entity_data,
            passages,
        );

        let utilization = if fitted.usage.total_available == 0 {
            0.0
        } else {
            fitted.usage.content_tokens() as f64 / fitted.usage.total_available as f64
        };
        info!(
            "Payload utilization {:.1}% ({} of {} tokens)",
            utilization * 100.0,
            fitted.usage.content_tokens(),
            fitted.usage.total_available
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_utilization(utilization);
            metrics.record_trimmed(fitted.trimmed_records);
        }

        ctx.token_usage = fitted.usage;
        let (divergence_detected, divergence_confidence) = ctx
            .pass2
            .as_ref()
            .map_or((false, 0.0), |p| (p.divergence_detected, p.confidence));

        ContextPayload {
            user_input: ctx.request.user_input.clone(),
            warm_slice: fitted.warm_slice,
            entity_data: fitted.entity_data,
            retrieved_passages: fitted.passages,
            analysis: ctx.analysis.clone(),
            metadata: PayloadMetadata {
                turn_id: ctx.turn_id,
                model_id: ctx.request.model_id.clone(),
                budget: fitted.allocation,
                token_usage: fitted.usage,
                utilization,
                within_bands: fitted.within_bands,
                trimmed_records: fitted.trimmed_records,
                divergence_detected,
                divergence_confidence,
            },
        }
    }

    /// Call the generator; failures become a typed outcome
    async fn apex_generation(&self, payload: &ContextPayload) -> GenerationOutcome {
        let Some(generator) = &self.generator else {
            warn!("No narrative generator configured");
            return GenerationOutcome::failed(
                GenerationFailure::Uninitialized,
                "narrative generator is not configured",
            );
        };
        if !generator.is_enabled() {
            warn!("Narrative generator is disabled");
            return GenerationOutcome::failed(
                GenerationFailure::Disabled,
                "narrative generator is disabled",
            );
        }

        match generator.generate_narrative(payload).await {
            Ok(generated) => {
                debug!("Generated narrative ({} chars)", generated.narrative.len());
                GenerationOutcome::Generated(generated)
            }
            Err(e) => {
                warn!("Narrative generation failed: {}", e);
                GenerationOutcome::failed(GenerationFailure::Error, e.to_string())
            }
        }
    }

    /// Commit the next baseline and hand its snapshot to the host
    async fn integration(
        &mut self,
        ctx: &mut TurnContext,
        generation: &GenerationOutcome,
    ) -> Option<BaselineSnapshot> {
        let GenerationOutcome::Generated(generated) = generation else {
            if let Some(memory) = self.memory.as_mut() {
                warn!("Generation failed; dropping baseline so it cannot leak into the next turn");
                memory.reset();
            }
            return None;
        };

        let Some(memory) = self.memory.as_mut() else {
            debug!("Dual-pass memory disabled; no baseline to commit");
            return None;
        };

        let payload = ctx.payload.clone().unwrap_or_default();
        let assembled_context = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                let e = ContextError::from(e);
                warn!("Could not serialize assembled context: {}", e);
                ctx.record_error(&e);
                serde_json::Value::Null
            }
        };

        let snapshot = memory.commit_baseline(BaselineInput {
            turn_id: ctx.turn_id,
            narrative: generated.narrative.clone(),
            warm_slice: payload.warm_slice,
            retrieved: payload.retrieved_passages,
            analysis: Some(ctx.analysis.clone()),
            entity_data: payload.entity_data,
            token_usage: ctx.token_usage,
            assembled_context,
            queries: ctx.deep_queries.clone(),
        });

        if let Some(sink) = &self.snapshot_sink {
            if let Err(e) = sink.persist(&snapshot).await {
                let e = ContextError::Integration(format!("snapshot persistence failed: {}", e));
                warn!("{}", e);
                ctx.record_error(&e);
            }
        }

        Some(snapshot)
    }
}

/// Free-text lookup key: the input plus names the analysis picked out
fn lookup_text(user_input: &str, analysis: &NarrativeAnalysis) -> String {
    let mut parts = vec![user_input.trim().to_string()];
    parts.extend(
        analysis
            .entities_mentioned
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty()),
    );
    parts.join(" ")
}

/// Trim, drop blanks and repeats, and cap
fn cap_queries(generated: Vec<String>, max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let queries: Vec<String> = generated
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && seen.insert(q.to_lowercase()))
        .collect();
    if queries.len() > max {
        debug!("Capping {} deep queries at {}", queries.len(), max);
    }
    queries.into_iter().take(max).collect()
}

/// One entry per chunk id at its best score, highest scores first
fn dedupe_passages(
    chunks: impl IntoIterator<Item = Chunk>,
    exclude: &HashSet<i64>,
    max_passages: usize,
) -> Vec<Chunk> {
    let mut best: IndexMap<i64, Chunk> = IndexMap::new();
    for chunk in chunks {
        if exclude.contains(&chunk.id) {
            continue;
        }
        match best.get_mut(&chunk.id) {
            Some(existing) if existing.score >= chunk.score => {}
            Some(existing) => *existing = chunk,
            None => {
                best.insert(chunk.id, chunk);
            }
        }
    }

    let mut passages: Vec<Chunk> = best.into_values().collect();
    passages.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    passages.truncate(max_passages);
    passages
}
