//! Per-pass ledger of issued retrieval queries

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Default per-pass iteration budget
pub const DEFAULT_MAX_ITERATIONS: usize = 5;

/// Half of a turn cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    /// Generated-turn half; establishes the baseline
    Baseline,
    /// User-response half; incremental retrieval against the baseline
    Incremental,
}

/// Bounded ledger of queries issued per pass
#[derive(Debug, Clone)]
pub struct QueryMemory {
    max_iterations: usize,
    ledger: HashMap<Pass, Vec<String>>,
}

impl QueryMemory {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ledger: HashMap::new(),
        }
    }

    /// Record a query; a no-op once the pass's iteration budget is spent
    pub fn record(&mut self, pass: Pass, query: &str) -> bool {
        let queries = self.ledger.entry(pass).or_default();
        if queries.len() >= self.max_iterations {
            debug!(
                "Query budget exhausted for {:?} pass ({} iterations); ignoring query",
                pass, self.max_iterations
            );
            return false;
        }
        queries.push(query.to_string());
        true
    }

    /// Whether a query already ran in any pass (trimmed, case-insensitive)
    pub fn has_run(&self, query: &str) -> bool {
        let needle = normalize(query);
        self.ledger
            .values()
            .flatten()
            .any(|seen| normalize(seen) == needle)
    }

    /// Clear a single pass
    pub fn reset(&mut self, pass: Pass) {
        self.ledger.remove(&pass);
    }

    /// Queries recorded for a pass
    pub fn queries(&self, pass: Pass) -> &[String] {
        self.ledger.get(&pass).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self, pass: Pass) -> usize {
        self.queries(pass).len()
    }

    /// Iterations left before records for a pass are ignored
    pub fn remaining(&self, pass: Pass) -> usize {
        self.max_iterations.saturating_sub(self.len(pass))
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }
}

impl Default for QueryMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS)
    }
}

fn normalize(query: &str) -> String {
    query.trim().to_lowercase()
}
