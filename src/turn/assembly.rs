//! Fit assembled content to the optimized allocation

use crate::context::models::{Chunk, EntityData, TokenUsage};
use crate::context::token_budget::{ContentAvailability, TokenBudget, TokenBudgetManager};
use tracing::{debug, info, warn};

/// Content that fits the turn's allocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FittedContent {
    pub warm_slice: Vec<Chunk>,
    pub entity_data: EntityData,
    /// Highest score first
    pub passages: Vec<Chunk>,
    pub allocation: TokenBudget,
    pub usage: TokenUsage,
    pub trimmed_records: usize,
    pub dropped_warm: usize,
    pub dropped_passages: usize,
    pub within_bands: bool,
}

fn chunk_tokens(manager: &TokenBudgetManager, chunks: &[Chunk]) -> usize {
    chunks.iter().map(|c| manager.estimate_tokens(&c.text)).sum()
}

/// Optimize the allocation for the content at hand, then cut content to it
///
/// The warm slice loses its oldest chunks first, entity data is trimmed with
/// baseline protection, and passages lose their lowest scores first.
pub fn fit_payload(
    manager: &TokenBudgetManager,
    budget: &TokenBudget,
    warm_slice: Vec<Chunk>,
    entity_data: &EntityData,
    mut passages: Vec<Chunk>,
) -> FittedContent {
    let available = ContentAvailability {
        warm_slice: chunk_tokens(manager, &warm_slice),
        structured: manager.entity_data_tokens(entity_data),
        augmentation: chunk_tokens(manager, &passages),
    };
    let allocation = manager.optimize_allocation(budget, &available);

    // Warm slice, oldest first out; the newest chunk always stays
    let warm_costs: Vec<usize> = warm_slice
        .iter()
        .map(|c| manager.estimate_tokens(&c.text))
        .collect();
    let mut warm_total = available.warm_slice;
    let mut drop_front = 0;
    while warm_total > allocation.warm_slice_tokens && drop_front + 1 < warm_costs.len() {
        warm_total -= warm_costs[drop_front];
        drop_front += 1;
    }
    let warm_slice: Vec<Chunk> = warm_slice.into_iter().skip(drop_front).collect();

    // An oversized newest chunk spends unallocated slack, then augmentation, then structured
    let overflow = warm_total
        .saturating_sub(allocation.warm_slice_tokens)
        .saturating_sub(allocation.remaining());
    let augmentation_cap = allocation.augmentation_tokens.saturating_sub(overflow);
    let overflow = overflow.saturating_sub(allocation.augmentation_tokens);
    let structured_cap = allocation.structured_tokens.saturating_sub(overflow);
    if overflow > allocation.structured_tokens {
        warn!(
            "Newest warm chunk ({} tokens) exceeds the whole content budget",
            warm_total
        );
    }

    // Structured data
    let original_records = entity_data.record_count();
    let entity_data = if available.structured > structured_cap {
        manager.trim_structured_with_baseline_protection(entity_data, structured_cap)
    } else {
        entity_data.clone()
    };
    let trimmed_records = original_records.saturating_sub(entity_data.record_count());
    let structured_tokens = manager.entity_data_tokens(&entity_data);

    // Passages, lowest score first out
    passages.sort_by(|a, b| b.score.total_cmp(&a.score));
    let offered = passages.len();
    let mut passage_total = available.augmentation;
    while passage_total > augmentation_cap {
        match passages.pop() {
            Some(dropped) => passage_total -= manager.estimate_tokens(&dropped.text),
            None => break,
        }
    }
    let dropped_passages = offered - passages.len();

    let usage = TokenUsage {
        total_available: allocation.total_available,
        warm_slice: warm_total,
        structured: structured_tokens,
        augmentation: passage_total,
    };

    let within_bands =
        manager.validate_budget_constraints(&allocation, &manager.config().components);
    if !within_bands {
        warn!("Allocation outside component bands; continuing with best-effort payload");
    }
    if drop_front > 0 || dropped_passages > 0 {
        debug!(
            "Fitting dropped {} warm chunks and {} passages",
            drop_front, dropped_passages
        );
    }

    info!(
        "Payload fitted: warm={} structured={} augmentation={} of {} available",
        usage.warm_slice, usage.structured, usage.augmentation, usage.total_available
    );

    FittedContent {
        warm_slice,
        entity_data,
        passages,
        allocation,
        usage,
        trimmed_records,
        dropped_warm: drop_front,
        dropped_passages,
        within_bands,
    }
}
