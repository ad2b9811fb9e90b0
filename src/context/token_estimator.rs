//! Token estimation strategies
//!
//! Exact tokenizer parity is not required; estimators only need to be
//! monotonic in the amount of text and should err on the high side.

use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Words per token assumed by the conservative word-count estimate
pub const WORDS_PER_TOKEN: f64 = 0.75;

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for multiple texts
    fn estimate_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate(t)).collect()
    }
}

/// Tiktoken-based token estimator using cl100k_base
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> anyhow::Result<Self> {
        let bpe = cl100k_base()?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Word-based token estimator
#[derive(Debug, Clone)]
pub struct WordBasedEstimator {
    words_per_token: f64,
}

impl WordBasedEstimator {
    pub fn new(words_per_token: f64) -> Self {
        Self { words_per_token }
    }

    /// `words / 0.75`, rounded up, so retrieved text is never under-costed
    pub fn conservative() -> Self {
        Self::new(WORDS_PER_TOKEN)
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::conservative()
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 / self.words_per_token).ceil() as usize
    }
}

/// Estimate a record's cost from its pretty-printed JSON form
///
/// Pretty printing keeps word-based estimates proportional to field count.
pub fn estimate_record<T: serde::Serialize>(estimator: &dyn TokenEstimator, value: &T) -> usize {
    estimator.estimate(&serde_json::to_string_pretty(value).unwrap_or_default())
}
