//! Configuration for the dual-pass context engine
//!
//! Loaded from an optional TOML file layered under `DUAL_PASS__*`
//! environment variables. The context window size has no default: a
//! missing `token_budget.apex_window` is a fatal configuration error.

use crate::error::{ContextError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

pub use crate::context::token_budget::{ComponentBand, ComponentBands, TokenBudgetConfig};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "DUAL_PASS";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub token_budget: TokenBudgetConfig,
    pub divergence: DivergenceConfig,
    pub query_memory: QueryMemoryConfig,
    pub retrieval: RetrievalConfig,
    pub entity_state: EntityStateConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env file is normal
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.token_budget.validate()?;
        self.divergence.validate()?;

        if self.retrieval.max_concurrency == 0 {
            return Err(ContextError::Configuration(
                "retrieval.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.retrieval.warm_slice_size == 0 {
            return Err(ContextError::Configuration(
                "retrieval.warm_slice_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Divergence detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceConfig {
    /// Confidence at or above which divergence is reported
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Minimum length of an alphabetic run to count as a reference
    #[serde(default = "default_min_word_length")]
    pub min_word_length: usize,

    /// Function words never treated as references
    #[serde(default = "default_stop_words")]
    pub stop_words: Vec<String>,

    /// Cap on enrichment searches accepted from the model
    #[serde(default = "default_llm_max_searches")]
    pub llm_max_searches: usize,
}

fn default_threshold() -> f32 {
    0.35
}

fn default_min_word_length() -> usize {
    4
}

fn default_llm_max_searches() -> usize {
    3
}

fn default_stop_words() -> Vec<String> {
    [
        "about", "above", "after", "again", "against", "also", "because", "been", "before",
        "being", "below", "between", "both", "back", "come", "could", "does", "doing", "down",
        "during", "each", "even", "every", "from", "further", "give", "going", "have",
        "having", "here", "into", "just", "know", "like", "look", "make", "maybe", "more",
        "most", "much", "must", "nothing", "okay", "only", "other", "over", "really", "same",
        "should", "some", "something", "anything", "still", "such", "take", "tell", "than",
        "that", "their", "theirs", "them", "then", "there", "these", "they", "think", "this",
        "those", "through", "time", "under", "until", "very", "want", "well", "were", "what",
        "when", "where", "which", "while", "whom", "will", "with", "would", "yeah", "your",
        "yours",
    ]
    .iter()
    .map(|w| w.to_string())
    .collect()
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            min_word_length: default_min_word_length(),
            stop_words: default_stop_words(),
            llm_max_searches: default_llm_max_searches(),
        }
    }
}

impl DivergenceConfig {
    /// Validate threshold range
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ContextError::Configuration(format!(
                "divergence.threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if self.min_word_length == 0 {
            return Err(ContextError::Configuration(
                "divergence.min_word_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Query ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMemoryConfig {
    /// Queries recorded per pass before further records are ignored
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_max_iterations() -> usize {
    5
}

impl Default for QueryMemoryConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Most-recent chunks fetched for the warm slice
    #[serde(default = "default_warm_slice_size")]
    pub warm_slice_size: usize,

    /// Results requested per incremental gap query
    #[serde(default = "default_incremental_k")]
    pub incremental_k: usize,

    /// Results requested per deep query
    #[serde(default = "default_deep_query_k")]
    pub deep_query_k: usize,

    /// Use hybrid vector/text search
    #[serde(default = "default_hybrid")]
    pub hybrid: bool,

    /// Deep queries executed per turn
    #[serde(default = "default_max_deep_queries")]
    pub max_deep_queries: usize,

    /// Retrieved passages retained after deduplication
    #[serde(default = "default_max_passages")]
    pub max_passages: usize,

    /// Concurrent sub-queries within a phase
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Approximate cost of one warm chunk, used to size warm-slice growth
    #[serde(default = "default_tokens_per_warm_chunk")]
    pub tokens_per_warm_chunk: usize,
}

fn default_warm_slice_size() -> usize {
    10
}

fn default_incremental_k() -> usize {
    5
}

fn default_deep_query_k() -> usize {
    10
}

fn default_hybrid() -> bool {
    true
}

fn default_max_deep_queries() -> usize {
    5
}

fn default_max_passages() -> usize {
    30
}

fn default_max_concurrency() -> usize {
    5
}

fn default_tokens_per_warm_chunk() -> usize {
    150
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            warm_slice_size: default_warm_slice_size(),
            incremental_k: default_incremental_k(),
            deep_query_k: default_deep_query_k(),
            hybrid: default_hybrid(),
            max_deep_queries: default_max_deep_queries(),
            max_passages: default_max_passages(),
            max_concurrency: default_max_concurrency(),
            tokens_per_warm_chunk: default_tokens_per_warm_chunk(),
        }
    }
}

/// Status filters for ENTITY_STATE lookups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityStateConfig {
    #[serde(default = "default_event_statuses")]
    pub event_statuses: Vec<String>,

    #[serde(default = "default_threat_statuses")]
    pub threat_statuses: Vec<String>,
}

fn default_event_statuses() -> Vec<String> {
    vec!["active".into(), "ongoing".into(), "escalating".into()]
}

fn default_threat_statuses() -> Vec<String> {
    vec!["active".into(), "imminent".into()]
}

impl Default for EntityStateConfig {
    fn default() -> Self {
        Self {
            event_statuses: default_event_statuses(),
            threat_statuses: default_threat_statuses(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
