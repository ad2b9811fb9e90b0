//! Token budget management for the apex generation call
//!
//! Splits a fixed context window into reserves and three content
//! components (warm slice, structured entity data, retrieved augmentation):
//! - Every component starts at its configured minimum share
//! - Unused budget is donated warm slice -> augmentation -> structured,
//!   capped by each component's maximum share and by actual content
//! - Structured data is trimmed by priority tier while baseline entity
//!   records are always retained

use super::models::{BudgetComponent, EntityData, FeaturedEntity, TieredEntities};
use super::token_estimator::{estimate_record, TokenEstimator, WordBasedEstimator};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Allowed share of `total_available` for one component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentBand {
    pub min: f64,
    pub max: f64,
}

impl ComponentBand {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Minimum tokens for this band, rounded down
    pub fn min_tokens(&self, total: usize) -> usize {
        (total as f64 * self.min).floor() as usize
    }

    /// Maximum tokens for this band, rounded down
    pub fn max_tokens(&self, total: usize) -> usize {
        (total as f64 * self.max).floor() as usize
    }
}

/// Per-component bands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentBands {
    #[serde(default = "default_warm_band")]
    pub warm_slice: ComponentBand,
    #[serde(default = "default_structured_band")]
    pub structured: ComponentBand,
    #[serde(default = "default_augmentation_band")]
    pub augmentation: ComponentBand,
}

fn default_warm_band() -> ComponentBand {
    ComponentBand::new(0.30, 0.50)
}

fn default_structured_band() -> ComponentBand {
    ComponentBand::new(0.15, 0.30)
}

fn default_augmentation_band() -> ComponentBand {
    ComponentBand::new(0.20, 0.40)
}

impl Default for ComponentBands {
    fn default() -> Self {
        Self {
            warm_slice: default_warm_band(),
            structured: default_structured_band(),
            augmentation: default_augmentation_band(),
        }
    }
}

impl ComponentBands {
    pub fn get(&self, component: BudgetComponent) -> ComponentBand {
        match component {
            BudgetComponent::WarmSlice => self.warm_slice,
            BudgetComponent::Structured => self.structured,
            BudgetComponent::Augmentation => self.augmentation,
        }
    }
}

/// Token budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgetConfig {
    /// Context window of the generation model; required
    #[serde(default)]
    pub apex_window: Option<usize>,

    #[serde(default = "default_system_prompt_tokens")]
    pub system_prompt_tokens: usize,

    #[serde(default = "default_response_reserve")]
    pub response_reserve: usize,

    /// Only applied for models matching `reasoning_model_pattern`
    #[serde(default = "default_reasoning_reserve")]
    pub reasoning_reserve: usize,

    #[serde(default = "default_reasoning_model_pattern")]
    pub reasoning_model_pattern: String,

    /// Share of `total_available` that optimization aims to fill
    #[serde(default = "default_target_utilization")]
    pub target_utilization: f64,

    /// Share of `total_available` set aside for pass-2 retrieval
    #[serde(default = "default_incremental_reserve_fraction")]
    pub incremental_reserve_fraction: f64,

    #[serde(default)]
    pub components: ComponentBands,
}

fn default_system_prompt_tokens() -> usize {
    4000
}

fn default_response_reserve() -> usize {
    4096
}

fn default_reasoning_reserve() -> usize {
    8192
}

fn default_reasoning_model_pattern() -> String {
    r"(?i)(^o[1-9]|reason|think|-r1)".to_string()
}

fn default_target_utilization() -> f64 {
    0.90
}

fn default_incremental_reserve_fraction() -> f64 {
    0.25
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            apex_window: None,
            system_prompt_tokens: default_system_prompt_tokens(),
            response_reserve: default_response_reserve(),
            reasoning_reserve: default_reasoning_reserve(),
            reasoning_model_pattern: default_reasoning_model_pattern(),
            target_utilization: default_target_utilization(),
            incremental_reserve_fraction: default_incremental_reserve_fraction(),
            components: ComponentBands::default(),
        }
    }
}

impl TokenBudgetConfig {
    /// Validate that the budget configuration is consistent
    pub fn validate(&self) -> Result<(), BudgetError> {
        let mut min_total = 0.0;
        for component in BudgetComponent::DONATION_ORDER {
            let band = self.components.get(component);
            if band.min < 0.0 || band.max > 1.0 || band.min > band.max {
                return Err(BudgetError::ConfigurationInvalid(format!(
                    "{} band [{}, {}] must satisfy 0 <= min <= max <= 1",
                    component, band.min, band.max
                )));
            }
            min_total += band.min;
        }

        if min_total > 1.0 {
            return Err(BudgetError::ConfigurationInvalid(format!(
                "component minimums sum to {:.2}, exceeding the available budget",
                min_total
            )));
        }

        if !(self.target_utilization > 0.0 && self.target_utilization <= 1.0) {
            return Err(BudgetError::ConfigurationInvalid(format!(
                "target_utilization must be within (0, 1], got {}",
                self.target_utilization
            )));
        }

        if !(0.0..=1.0).contains(&self.incremental_reserve_fraction) {
            return Err(BudgetError::ConfigurationInvalid(format!(
                "incremental_reserve_fraction must be within [0, 1], got {}",
                self.incremental_reserve_fraction
            )));
        }

        Regex::new(&self.reasoning_model_pattern)
            .map_err(|e| BudgetError::ConfigurationInvalid(format!(
                "reasoning_model_pattern: {}",
                e
            )))?;

        Ok(())
    }
}

/// Per-turn token allocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub apex_window: usize,
    pub system_prompt_tokens: usize,
    pub user_input_tokens: usize,
    pub reasoning_reserve: usize,
    pub response_reserve: usize,
    pub warm_slice_tokens: usize,
    pub structured_tokens: usize,
    pub augmentation_tokens: usize,
    pub total_available: usize,
}

impl TokenBudget {
    pub fn get(&self, component: BudgetComponent) -> usize {
        match component {
            BudgetComponent::WarmSlice => self.warm_slice_tokens,
            BudgetComponent::Structured => self.structured_tokens,
            BudgetComponent::Augmentation => self.augmentation_tokens,
        }
    }

    pub fn set(&mut self, component: BudgetComponent, tokens: usize) {
        match component {
            BudgetComponent::WarmSlice => self.warm_slice_tokens = tokens,
            BudgetComponent::Structured => self.structured_tokens = tokens,
            BudgetComponent::Augmentation => self.augmentation_tokens = tokens,
        }
    }

    /// Tokens allocated to content components
    pub fn allocated(&self) -> usize {
        self.warm_slice_tokens + self.structured_tokens + self.augmentation_tokens
    }

    /// Unallocated share of `total_available`
    pub fn remaining(&self) -> usize {
        self.total_available.saturating_sub(self.allocated())
    }

    /// Fraction of `total_available` allocated (0.0 when nothing is available)
    pub fn utilization(&self) -> f64 {
        if self.total_available == 0 {
            return 0.0;
        }
        self.allocated() as f64 / self.total_available as f64
    }

    /// Everything charged against the window: reserves, overhead, and content
    pub fn committed(&self) -> usize {
        self.system_prompt_tokens
            .saturating_add(self.user_input_tokens)
            .saturating_add(self.reasoning_reserve)
            .saturating_add(self.response_reserve)
            .saturating_add(self.allocated())
    }
}

/// Content actually available per component, in tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentAvailability {
    pub warm_slice: usize,
    pub structured: usize,
    pub augmentation: usize,
}

impl ContentAvailability {
    pub fn get(&self, component: BudgetComponent) -> usize {
        match component {
            BudgetComponent::WarmSlice => self.warm_slice,
            BudgetComponent::Structured => self.structured,
            BudgetComponent::Augmentation => self.augmentation,
        }
    }
}

/// Budget left for pass-2 retrieval after a baseline is assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalReserve {
    pub target: usize,
    pub remaining: usize,
    pub shortfall: usize,
}

/// Token budget errors
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("Required configuration missing: {0}")]
    MissingConfiguration(String),
}

/// Token budget manager
pub struct TokenBudgetManager {
    config: TokenBudgetConfig,
    estimator: Arc<dyn TokenEstimator>,
    reasoning_pattern: Regex,
}

impl TokenBudgetManager {
    /// Create a new token budget manager with the conservative word estimator
    pub fn new(config: TokenBudgetConfig) -> Result<Self, BudgetError> {
        Self::with_estimator(config, Arc::new(WordBasedEstimator::conservative()))
    }

    /// Create with a custom estimator
    pub fn with_estimator(
        config: TokenBudgetConfig,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self, BudgetError> {
        config.validate()?;
        let reasoning_pattern = Regex::new(&config.reasoning_model_pattern)
            .map_err(|e| BudgetError::ConfigurationInvalid(e.to_string()))?;
        Ok(Self {
            config,
            estimator,
            reasoning_pattern,
        })
    }

    /// Whether the model gets a reasoning reserve
    pub fn is_reasoning_model(&self, model_id: &str) -> bool {
        self.reasoning_pattern.is_match(model_id)
    }

    /// Compute the starting allocation for a turn
    pub fn calculate_budget(&self, user_input: &str, model_id: &str) -> Result<TokenBudget, BudgetError> {
        let apex_window = self.config.apex_window.ok_or_else(|| {
            BudgetError::MissingConfiguration("token_budget.apex_window".to_string())
        })?;

        let user_input_tokens = self.estimator.estimate(user_input);
        let reasoning_reserve = if self.is_reasoning_model(model_id) {
            self.config.reasoning_reserve
        } else {
            0
        };

        let overhead = [
            self.config.system_prompt_tokens,
            user_input_tokens,
            reasoning_reserve,
            self.config.response_reserve,
        ]
        .iter()
        .try_fold(0usize, |acc, t| acc.checked_add(*t))
        .unwrap_or_else(|| {
            warn!("Token overhead overflowed; clamping to usize::MAX");
            usize::MAX
        });

        let total_available = match apex_window.checked_sub(overhead) {
            Some(available) => available,
            None => {
                warn!(
                    "Reserves exceed context window: {} > {}; clamping available budget to 0",
                    overhead, apex_window
                );
                0
            }
        };

        let bands = &self.config.components;
        let budget = TokenBudget {
            apex_window,
            system_prompt_tokens: self.config.system_prompt_tokens,
            user_input_tokens,
            reasoning_reserve,
            response_reserve: self.config.response_reserve,
            warm_slice_tokens: bands.warm_slice.min_tokens(total_available),
            structured_tokens: bands.structured.min_tokens(total_available),
            augmentation_tokens: bands.augmentation.min_tokens(total_available),
            total_available,
        };

        debug!(
            "Budget for model {}: window={}, available={}, warm={}, structured={}, augmentation={}",
            model_id,
            apex_window,
            total_available,
            budget.warm_slice_tokens,
            budget.structured_tokens,
            budget.augmentation_tokens
        );

        Ok(budget)
    }

    /// Raise utilization toward the target by donating unused budget
    pub fn optimize_allocation(
        &self,
        current: &TokenBudget,
        available_content: &ContentAvailability,
    ) -> TokenBudget {
        let mut budget = current.clone();
        let total = budget.total_available;
        let target = (total as f64 * self.config.target_utilization).floor() as usize;
        let mut allocated = budget.allocated();

        if allocated >= target {
            debug!("Allocation already at target: {} >= {}", allocated, target);
            return budget;
        }

        for component in BudgetComponent::DONATION_ORDER {
            let wanted = target.saturating_sub(allocated);
            if wanted == 0 {
                break;
            }

            let cap = self.config.components.get(component).max_tokens(total);
            let ceiling = cap.min(available_content.get(component));
            let held = budget.get(component);
            if ceiling <= held {
                continue;
            }

            let donation = (ceiling - held).min(wanted);
            budget.set(component, held + donation);
            allocated += donation;
            debug!("Donated {} tokens to {}", donation, component);
        }

        info!(
            "Optimized allocation: {}/{} tokens ({:.1}% utilization, target {:.1}%)",
            allocated,
            total,
            budget.utilization() * 100.0,
            self.config.target_utilization * 100.0
        );

        budget
    }

    /// Check every component share lies within its band
    pub fn validate_budget_constraints(
        &self,
        allocation: &TokenBudget,
        constraints: &ComponentBands,
    ) -> bool {
        let total = allocation.total_available;
        if allocation.allocated() > total {
            warn!(
                "Allocation exceeds available budget: {} > {}",
                allocation.allocated(),
                total
            );
            return false;
        }

        for component in BudgetComponent::DONATION_ORDER {
            let band = constraints.get(component);
            let tokens = allocation.get(component);
            let low = band.min_tokens(total);
            let high = (total as f64 * band.max).ceil() as usize;
            if tokens < low || tokens > high {
                warn!(
                    "{} allocation {} outside band [{}, {}]",
                    component, tokens, low, high
                );
                return false;
            }
        }

        true
    }

    /// Trim trimmable entity records to fit `ceiling`, never touching baseline records
    pub fn trim_structured_with_baseline_protection(
        &self,
        entity_data: &EntityData,
        ceiling: usize,
    ) -> EntityData {
        let baseline_cost: usize = entity_data
            .baseline_records()
            .map(|record| self.record_tokens(record))
            .sum();

        // Slot = (collection, position) so kept records can be put back in order
        let mut candidates: Vec<((u8, usize), u8, usize)> = Vec::new();
        for (slot, collection) in trimmable_collections(entity_data).into_iter().enumerate() {
            for (position, record) in collection.iter().enumerate() {
                candidates.push((
                    (slot as u8, position),
                    record.priority_tier(),
                    self.record_tokens(record),
                ));
            }
        }
        let trimmable_cost: usize = candidates.iter().map(|(_, _, cost)| cost).sum();

        if baseline_cost + trimmable_cost <= ceiling {
            debug!(
                "Structured data fits: {} + {} <= {}",
                baseline_cost, trimmable_cost, ceiling
            );
            return entity_data.clone();
        }

        let mut kept: HashSet<(u8, usize)> = HashSet::new();
        if baseline_cost >= ceiling {
            error!(
                "Baseline entity records alone ({} tokens) meet or exceed the structured ceiling ({}); \
                 dropping all {} featured records. The structured band is misconfigured.",
                baseline_cost,
                ceiling,
                candidates.len()
            );
        } else {
            let remaining = ceiling - baseline_cost;
            candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)));

            let mut used = 0usize;
            for (slot, _, cost) in &candidates {
                if used + cost > remaining {
                    break;
                }
                used += cost;
                kept.insert(*slot);
            }

            info!(
                "Trimmed structured data: kept {}/{} featured records ({} of {} trimmable tokens)",
                kept.len(),
                candidates.len(),
                used,
                remaining
            );
        }

        EntityData {
            characters: TieredEntities {
                baseline: entity_data.characters.baseline.clone(),
                featured: retain_kept(&entity_data.characters.featured, 0, &kept),
            },
            places: TieredEntities {
                baseline: entity_data.places.baseline.clone(),
                featured: retain_kept(&entity_data.places.featured, 1, &kept),
            },
            factions: TieredEntities {
                baseline: entity_data.factions.baseline.clone(),
                featured: retain_kept(&entity_data.factions.featured, 2, &kept),
            },
            relationships: retain_kept(&entity_data.relationships, 3, &kept),
            events: retain_kept(&entity_data.events, 4, &kept),
            threats: retain_kept(&entity_data.threats, 5, &kept),
        }
    }

    /// Split what a baseline leaves over for pass-2 retrieval
    pub fn incremental_reserve(&self, total_available: usize, baseline_cost: usize) -> IncrementalReserve {
        let target =
            (total_available as f64 * self.config.incremental_reserve_fraction).floor() as usize;
        let remaining = total_available.saturating_sub(baseline_cost);
        let shortfall = target.saturating_sub(remaining);

        if shortfall > 0 {
            warn!(
                "Pass-2 reserve short by {} tokens: {} remaining of {} targeted",
                shortfall, remaining, target
            );
        }

        IncrementalReserve {
            target,
            remaining,
            shortfall,
        }
    }

    /// Estimate tokens for text
    pub fn estimate_tokens(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    /// Estimate tokens for a structured record
    pub fn record_tokens<T: Serialize>(&self, record: &T) -> usize {
        estimate_record(self.estimator.as_ref(), record)
    }

    /// Structured-data cost of an entity snapshot
    pub fn entity_data_tokens(&self, entity_data: &EntityData) -> usize {
        entity_data
            .baseline_records()
            .map(|r| self.record_tokens(r))
            .chain(entity_data.trimmable_records().map(|r| self.record_tokens(r)))
            .sum()
    }

    /// Get the estimator
    pub fn estimator(&self) -> Arc<dyn TokenEstimator> {
        Arc::clone(&self.estimator)
    }

    /// Get the configuration
    pub fn config(&self) -> &TokenBudgetConfig {
        &self.config
    }
}

fn trimmable_collections(data: &EntityData) -> [&Vec<FeaturedEntity>; 6] {
    [
        &data.characters.featured,
        &data.places.featured,
        &data.factions.featured,
        &data.relationships,
        &data.events,
        &data.threats,
    ]
}

fn retain_kept(records: &[FeaturedEntity], slot: u8, kept: &HashSet<(u8, usize)>) -> Vec<FeaturedEntity> {
    records
        .iter()
        .enumerate()
        .filter(|(position, _)| kept.contains(&(slot, *position)))
        .map(|(_, record)| record.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::models::{BaselineEntity, EntityKind, EntityRecord};

    fn config_with_window(window: usize) -> TokenBudgetConfig {
        TokenBudgetConfig {
            apex_window: Some(window),
            system_prompt_tokens: 1000,
            response_reserve: 1000,
            reasoning_reserve: 2000,
            ..Default::default()
        }
    }

    fn manager(window: usize) -> TokenBudgetManager {
        TokenBudgetManager::new(config_with_window(window)).unwrap()
    }

    fn character(id: i64, name: &str, in_scene: bool) -> FeaturedEntity {
        let mut entity = FeaturedEntity::new(id, EntityKind::Character, name)
            .with_detail("description", "a weathered sailor with a long memory of the war");
        entity.in_scene = in_scene;
        entity
    }

    fn data_with(characters: Vec<FeaturedEntity>, threats: Vec<FeaturedEntity>) -> EntityData {
        let mut records: Vec<EntityRecord> = characters
            .iter()
            .map(|c| EntityRecord::Baseline(c.to_baseline()))
            .collect();
        records.extend(characters.into_iter().map(EntityRecord::Featured));
        EntityData {
            characters: TieredEntities::from_records(records),
            places: TieredEntities {
                baseline: vec![BaselineEntity {
                    id: 90,
                    kind: EntityKind::Place,
                    name: "Saltmarsh".into(),
                    status: None,
                }],
                featured: vec![],
            },
            threats,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(TokenBudgetConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_band_rejected() {
        let mut config = config_with_window(10_000);
        config.components.structured = ComponentBand::new(0.5, 0.4);
        assert!(matches!(
            config.validate(),
            Err(BudgetError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn test_minimums_exceeding_budget_rejected() {
        let mut config = config_with_window(10_000);
        config.components.warm_slice = ComponentBand::new(0.6, 0.8);
        config.components.augmentation = ComponentBand::new(0.5, 0.6);
        assert!(TokenBudgetManager::new(config).is_err());
    }

    #[test]
    fn test_missing_window_is_fatal() {
        let manager = TokenBudgetManager::new(TokenBudgetConfig::default()).unwrap();
        let result = manager.calculate_budget("hello there", "gpt-4o");
        assert!(matches!(result, Err(BudgetError::MissingConfiguration(_))));
    }

    #[test]
    fn test_calculate_budget_starts_at_minimums() {
        let manager = manager(12_000);
        let budget = manager.calculate_budget("I open the door", "gpt-4o").unwrap();

        assert_eq!(budget.reasoning_reserve, 0);
        assert_eq!(budget.user_input_tokens, 6); // 4 words / 0.75
        assert_eq!(budget.total_available, 12_000 - 1000 - 6 - 1000);
        assert_eq!(
            budget.warm_slice_tokens,
            (budget.total_available as f64 * 0.30).floor() as usize
        );
        assert!(budget.committed() <= budget.apex_window);
    }

    #[test]
    fn test_reasoning_reserve_only_for_reasoning_models() {
        let manager = manager(12_000);
        let plain = manager.calculate_budget("go", "gpt-4o").unwrap();
        let reasoning = manager.calculate_budget("go", "o3-mini").unwrap();

        assert_eq!(plain.reasoning_reserve, 0);
        assert_eq!(reasoning.reasoning_reserve, 2000);
        assert_eq!(plain.total_available - reasoning.total_available, 2000);
    }

    #[test]
    fn test_negative_available_clamped_to_zero() {
        let manager = manager(1500);
        let budget = manager.calculate_budget("look around", "o1").unwrap();
        assert_eq!(budget.total_available, 0);
        assert_eq!(budget.allocated(), 0);
    }

    #[test]
    fn test_optimize_respects_conservation_and_bands() {
        let manager = manager(12_000);
        let budget = manager.calculate_budget("I open the door", "gpt-4o").unwrap();
        let plenty = ContentAvailability {
            warm_slice: 100_000,
            structured: 100_000,
            augmentation: 100_000,
        };

        let optimized = manager.optimize_allocation(&budget, &plenty);
        assert!(optimized.allocated() <= optimized.total_available);
        assert!(optimized.utilization() > budget.utilization());
        assert!(manager.validate_budget_constraints(&optimized, &manager.config().components));
        assert!(optimized.committed() <= optimized.apex_window);
    }

    #[test]
    fn test_optimize_donates_warm_slice_first() {
        let manager = manager(12_000);
        let budget = manager.calculate_budget("go", "gpt-4o").unwrap();
        let total = budget.total_available;
        let plenty = ContentAvailability {
            warm_slice: 100_000,
            structured: 100_000,
            augmentation: 100_000,
        };

        let optimized = manager.optimize_allocation(&budget, &plenty);
        assert_eq!(optimized.warm_slice_tokens, (total as f64 * 0.50).floor() as usize);
        assert!(optimized.augmentation_tokens > budget.augmentation_tokens);
    }

    #[test]
    fn test_optimize_capped_by_available_content() {
        let manager = manager(12_000);
        let budget = manager.calculate_budget("go", "gpt-4o").unwrap();
        let scarce = ContentAvailability {
            warm_slice: 0,
            structured: 0,
            augmentation: 0,
        };

        let optimized = manager.optimize_allocation(&budget, &scarce);
        assert_eq!(optimized, budget);
    }

    #[test]
    fn test_validate_rejects_out_of_band() {
        let manager = manager(12_000);
        let mut budget = manager.calculate_budget("go", "gpt-4o").unwrap();
        budget.structured_tokens = budget.total_available;
        assert!(!manager.validate_budget_constraints(&budget, &manager.config().components));
    }

    #[test]
    fn test_trim_noop_when_fits() {
        let manager = manager(12_000);
        let data = data_with(vec![character(1, "Mira", true)], vec![]);
        let trimmed = manager.trim_structured_with_baseline_protection(&data, 10_000);
        assert_eq!(trimmed, data);
    }

    #[test]
    fn test_trim_drops_all_when_baseline_exceeds_ceiling() {
        let manager = manager(12_000);
        let data = data_with(
            vec![character(1, "Mira", true), character(2, "Oren", false)],
            vec![FeaturedEntity::new(5, EntityKind::Threat, "Plague")],
        );

        let trimmed = manager.trim_structured_with_baseline_protection(&data, 1);
        assert_eq!(trimmed.trimmable_records().count(), 0);
        assert_eq!(trimmed.characters.baseline, data.characters.baseline);
        assert_eq!(trimmed.places.baseline, data.places.baseline);
    }

    #[test]
    fn test_trim_keeps_higher_priority_record() {
        let manager = manager(12_000);
        let present = character(1, "Mira", true);
        let absent = character(2, "Oren", false);
        let data = data_with(vec![absent.clone(), present.clone()], vec![]);

        let baseline_cost: usize = data.baseline_records().map(|r| manager.record_tokens(r)).sum();
        let one_fits = baseline_cost + manager.record_tokens(&present);
        assert_eq!(manager.record_tokens(&present), manager.record_tokens(&absent));

        let trimmed = manager.trim_structured_with_baseline_protection(&data, one_fits);
        assert_eq!(trimmed.characters.featured, vec![present]);
    }

    #[test]
    fn test_trim_is_idempotent_and_protects_baseline() {
        let manager = manager(12_000);
        let data = data_with(
            vec![
                character(1, "Mira", true),
                character(2, "Oren", false),
                character(3, "Tamsin", false),
            ],
            vec![FeaturedEntity::new(5, EntityKind::Threat, "Plague")],
        );
        let baseline_cost: usize = data.baseline_records().map(|r| manager.record_tokens(r)).sum();

        for ceiling in [0, baseline_cost / 2, baseline_cost, baseline_cost + 40, baseline_cost + 90] {
            let once = manager.trim_structured_with_baseline_protection(&data, ceiling);
            let twice = manager.trim_structured_with_baseline_protection(&once, ceiling);
            assert_eq!(once, twice, "ceiling {}", ceiling);

            let baseline: Vec<_> = once.baseline_records().cloned().collect();
            let original: Vec<_> = data.baseline_records().cloned().collect();
            assert_eq!(baseline, original, "ceiling {}", ceiling);
        }
    }

    #[test]
    fn test_incremental_reserve_shortfall() {
        let manager = manager(12_000);
        let reserve = manager.incremental_reserve(1000, 940);
        assert_eq!(reserve.target, 250);
        assert_eq!(reserve.remaining, 60);
        assert_eq!(reserve.shortfall, 190);

        let roomy = manager.incremental_reserve(1200, 630);
        assert_eq!(roomy.remaining, 570);
        assert_eq!(roomy.shortfall, 0);
    }
}
