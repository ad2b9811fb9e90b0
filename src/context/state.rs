//! Baseline (pass 1) and incremental (pass 2) context state

use super::models::{BudgetComponent, Chunk, EntityRef, NarrativeAnalysis, TokenUsage};
use super::token_estimator::{TokenEstimator, WordBasedEstimator};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Lifecycle of the tracked context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Empty,
    BaselineActive,
    BaselineActiveWithIncrement,
}

/// Output of a completed pass 1
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPackage {
    pub baseline_chunk_ids: BTreeSet<i64>,
    pub baseline_entities: BTreeMap<String, EntityRef>,
    pub baseline_themes: Vec<String>,
    pub token_usage: TokenUsage,
    pub divergence_detected: bool,
    pub divergence_confidence: f32,
    pub additional_chunk_ids: BTreeSet<i64>,
    pub gap_analysis: BTreeMap<String, String>,
}

/// Hand-off from pass 1 to pass 2
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassTransition {
    pub prior_narrative_text: String,
    pub expected_user_themes: Vec<String>,
    pub assembled_context: serde_json::Value,
    /// Non-increasing within a pass-2 cycle
    pub remaining_budget: usize,
}

/// Counts-only view of the current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub state: ContextState,
    pub baseline_chunks: usize,
    pub additional_chunks: usize,
    pub warm_slice_chunks: usize,
    pub baseline_entities: usize,
    pub baseline_themes: usize,
    pub divergence_detected: bool,
    pub divergence_confidence: f32,
    pub remaining_budget: usize,
    pub incremental_tokens: usize,
}

/// Tracks the active baseline and any pass-2 increments
#[derive(Debug)]
pub struct ContextStateManager {
    state: ContextState,
    package: Option<ContextPackage>,
    transition: Option<PassTransition>,
    baseline_warm_slice: Vec<Chunk>,
    baseline_retrieved: Vec<Chunk>,
    analysis: Option<NarrativeAnalysis>,
    warm_expansions: Vec<Chunk>,
    augmentations: Vec<Chunk>,
    component_usage: HashMap<BudgetComponent, usize>,
    incremental_tokens: usize,
    estimator: WordBasedEstimator,
}

impl ContextStateManager {
    pub fn new() -> Self {
        Self {
            state: ContextState::Empty,
            package: None,
            transition: None,
            baseline_warm_slice: Vec::new(),
            baseline_retrieved: Vec::new(),
            analysis: None,
            warm_expansions: Vec::new(),
            augmentations: Vec::new(),
            component_usage: HashMap::new(),
            incremental_tokens: 0,
            estimator: WordBasedEstimator::conservative(),
        }
    }

    /// Install a new baseline, replacing all prior state
    pub fn initialize_pass1(
        &mut self,
        package: ContextPackage,
        transition: PassTransition,
        warm_slice: Vec<Chunk>,
        retrieved: Vec<Chunk>,
        analysis: Option<NarrativeAnalysis>,
    ) {
        info!(
            "Initializing baseline: {} chunks, {} entities, remaining budget {}",
            package.baseline_chunk_ids.len(),
            package.baseline_entities.len(),
            transition.remaining_budget
        );

        self.clear_increments();
        self.package = Some(package);
        self.transition = Some(transition);
        self.baseline_warm_slice = warm_slice;
        self.baseline_retrieved = retrieved;
        self.analysis = analysis;
        self.state = ContextState::BaselineActive;
    }

    /// Drop everything; used when generation fails outright
    pub fn reset(&mut self) {
        debug!("Resetting context state from {:?}", self.state);
        *self = Self::new();
    }

    /// Register pass-2 chunks; chunks already present are skipped
    ///
    /// `token_usage` covers the whole batch at the conservative word estimate.
    /// Skipped chunks have their own estimate deducted, so re-registering
    /// charges nothing and a mixed batch is charged only for its new chunks.
    pub fn register_additional_chunks(
        &mut self,
        chunks: Vec<Chunk>,
        component: BudgetComponent,
        token_usage: usize,
        as_warm_slice: bool,
    ) -> Vec<i64> {
        let offered = chunks.len();
        let Some(package) = self.package.as_mut() else {
            warn!("Ignoring {} chunks registered without a baseline", offered);
            return Vec::new();
        };

        let mut added = Vec::new();
        let mut skipped_tokens = 0;
        for chunk in chunks {
            if package.baseline_chunk_ids.contains(&chunk.id)
                || package.additional_chunk_ids.contains(&chunk.id)
            {
                debug!("Chunk {} already registered; skipping", chunk.id);
                skipped_tokens += self.estimator.estimate(&chunk.text);
                continue;
            }
            package.additional_chunk_ids.insert(chunk.id);
            added.push(chunk.id);
            if as_warm_slice {
                self.warm_expansions.push(chunk);
            } else {
                self.augmentations.push(chunk);
            }
        }

        if added.is_empty() {
            return added;
        }

        let charged = token_usage.saturating_sub(skipped_tokens);
        *self.component_usage.entry(component).or_insert(0) += charged;
        self.incremental_tokens += charged;
        self.state = ContextState::BaselineActiveWithIncrement;

        debug!(
            "Registered {} of {} chunks as {} ({} tokens)",
            added.len(),
            offered,
            component,
            charged
        );

        added
    }

    /// Decrement the pass-2 budget; returns the amount actually consumed
    pub fn consume_budget(&mut self, amount: usize) -> usize {
        let Some(transition) = self.transition.as_mut() else {
            return 0;
        };
        let consumed = amount.min(transition.remaining_budget);
        transition.remaining_budget -= consumed;
        consumed
    }

    /// Record the outcome of divergence detection on the package
    pub fn record_divergence(
        &mut self,
        detected: bool,
        confidence: f32,
        gap_analysis: BTreeMap<String, String>,
    ) {
        if let Some(package) = self.package.as_mut() {
            package.divergence_detected = detected;
            package.divergence_confidence = confidence;
            package.gap_analysis = gap_analysis;
        }
    }

    /// Baseline warm slice followed by pass-2 expansions, in order
    pub fn warm_slice(&self) -> Vec<&Chunk> {
        self.baseline_warm_slice
            .iter()
            .chain(self.warm_expansions.iter())
            .collect()
    }

    /// Chunks appended to the warm slice during pass 2
    pub fn warm_expansions(&self) -> &[Chunk] {
        &self.warm_expansions
    }

    /// Chunks pulled in by pass-2 gap retrieval
    pub fn augmentations(&self) -> &[Chunk] {
        &self.augmentations
    }

    /// Baseline retrieved passages
    pub fn baseline_retrieved(&self) -> &[Chunk] {
        &self.baseline_retrieved
    }

    /// Baseline and additional chunk ids
    pub fn all_chunk_ids(&self) -> BTreeSet<i64> {
        match &self.package {
            Some(package) => package
                .baseline_chunk_ids
                .union(&package.additional_chunk_ids)
                .copied()
                .collect(),
            None => BTreeSet::new(),
        }
    }

    pub fn is_registered(&self, chunk_id: i64) -> bool {
        self.package.as_ref().map_or(false, |p| {
            p.baseline_chunk_ids.contains(&chunk_id) || p.additional_chunk_ids.contains(&chunk_id)
        })
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn package(&self) -> Option<&ContextPackage> {
        self.package.as_ref()
    }

    pub fn transition(&self) -> Option<&PassTransition> {
        self.transition.as_ref()
    }

    pub fn analysis(&self) -> Option<&NarrativeAnalysis> {
        self.analysis.as_ref()
    }

    pub fn remaining_budget(&self) -> usize {
        self.transition.as_ref().map_or(0, |t| t.remaining_budget)
    }

    /// Pass-2 tokens charged so far
    pub fn incremental_tokens(&self) -> usize {
        self.incremental_tokens
    }

    pub fn component_usage(&self, component: BudgetComponent) -> usize {
        self.component_usage.get(&component).copied().unwrap_or(0)
    }

    /// Observability summary; carries no raw content
    pub fn summary(&self) -> ContextSummary {
        let package = self.package.as_ref();
        ContextSummary {
            state: self.state,
            baseline_chunks: package.map_or(0, |p| p.baseline_chunk_ids.len()),
            additional_chunks: package.map_or(0, |p| p.additional_chunk_ids.len()),
            warm_slice_chunks: self.baseline_warm_slice.len() + self.warm_expansions.len(),
            baseline_entities: package.map_or(0, |p| p.baseline_entities.len()),
            baseline_themes: package.map_or(0, |p| p.baseline_themes.len()),
            divergence_detected: package.map_or(false, |p| p.divergence_detected),
            divergence_confidence: package.map_or(0.0, |p| p.divergence_confidence),
            remaining_budget: self.remaining_budget(),
            incremental_tokens: self.incremental_tokens,
        }
    }

    fn clear_increments(&mut self) {
        self.warm_expansions.clear();
        self.augmentations.clear();
        self.component_usage.clear();
        self.incremental_tokens = 0;
    }
}

impl Default for ContextStateManager {
    fn default() -> Self {
        Self::new()
    }
}
