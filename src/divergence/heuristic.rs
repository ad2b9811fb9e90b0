//! Heuristic divergence detection
//!
//! Candidate references are alphabetic runs of at least `min_word_length`
//! characters (minus stop words) plus runs of two or more capitalized words.
//! Anything not found among baseline entity names and aliases, baseline and
//! expected themes, or the prior narrative counts as unmatched.
//!
//! A capitalized sentence opener joins the phrase after it ("Visit Saltmarsh
//! Harbor"), so a phrase also counts as known when any trailing run of two or
//! more of its words is known.

use super::{DivergenceDetection, DivergenceResult, HeuristicDivergence};
use crate::config::DivergenceConfig;
use crate::context::state::{ContextPackage, PassTransition};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

static PROPER_NOUN_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\p{Lu}\p{L}+(?:[ \t]+\p{Lu}\p{L}+)+\b").expect("valid proper noun pattern")
});

/// References extracted from a piece of text, lowercased
#[derive(Debug, Default, Clone, PartialEq)]
pub struct References {
    pub words: BTreeSet<String>,
    pub phrases: BTreeSet<String>,
}

impl References {
    /// Words and phrases combined
    pub fn all(&self) -> BTreeSet<String> {
        self.words.union(&self.phrases).cloned().collect()
    }
}

/// Reference-overlap divergence detector
pub struct HeuristicDivergenceDetector {
    threshold: f32,
    min_word_length: usize,
    stop_words: HashSet<String>,
}

impl HeuristicDivergenceDetector {
    pub fn new(config: &DivergenceConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_word_length: config.min_word_length,
            stop_words: config.stop_words.iter().map(|w| w.to_lowercase()).collect(),
        }
    }

    /// Extract candidate references from text
    pub fn extract_references(&self, text: &str) -> References {
        let mut references = References::default();

        for word in alphabetic_runs(text, self.min_word_length) {
            if !self.stop_words.contains(&word) {
                references.words.insert(word);
            }
        }

        for phrase in PROPER_NOUN_PHRASE.find_iter(text) {
            let words: Vec<String> = phrase
                .as_str()
                .split_whitespace()
                .map(str::to_lowercase)
                .skip_while(|w| self.stop_words.contains(w))
                .collect();
            if words.len() >= 2 {
                references.phrases.insert(words.join(" "));
            }
        }

        references
    }

    /// Vocabulary the baseline already covers
    fn known_vocabulary(&self, baseline: &ContextPackage, transition: &PassTransition) -> HashSet<String> {
        let mut known = HashSet::new();

        let add_term = |term: &str, known: &mut HashSet<String>| {
            let lowered = term.trim().to_lowercase();
            if lowered.is_empty() {
                return;
            }
            for word in alphabetic_runs(&lowered, 1) {
                known.insert(word);
            }
            known.insert(lowered.split_whitespace().collect::<Vec<_>>().join(" "));
        };

        for (name, entity) in &baseline.baseline_entities {
            add_term(name, &mut known);
            for alias in &entity.aliases {
                add_term(alias, &mut known);
            }
        }
        for theme in baseline
            .baseline_themes
            .iter()
            .chain(transition.expected_user_themes.iter())
        {
            add_term(theme, &mut known);
        }

        known.extend(self.extract_references(&transition.prior_narrative_text).all());
        known
    }

    fn evaluate(&self, user_input: &str, baseline: &ContextPackage, transition: &PassTransition) -> HeuristicDivergence {
        let references = self.extract_references(user_input);
        let candidates = references.all();
        if candidates.is_empty() {
            return HeuristicDivergence::default();
        }

        let known = self.known_vocabulary(baseline, transition);
        let unmatched: BTreeSet<&String> = references
            .words
            .iter()
            .filter(|w| !known.contains(*w))
            .chain(references.phrases.iter().filter(|p| !phrase_known(p, &known)))
            .collect();

        let unmatched_entities: Vec<String> = references
            .phrases
            .iter()
            .filter(|p| unmatched.contains(p))
            .cloned()
            .collect();

        // Words already covered by an unmatched phrase do not need their own query
        let phrase_words: HashSet<&str> = unmatched_entities
            .iter()
            .flat_map(|p| p.split(' '))
            .collect();
        let mut gaps = unmatched_entities.clone();
        gaps.extend(
            references
                .words
                .iter()
                .filter(|w| unmatched.contains(w) && !phrase_words.contains(w.as_str()))
                .cloned(),
        );

        let confidence = unmatched.len() as f32 / candidates.len().max(1) as f32;
        let detected = confidence >= self.threshold && !unmatched.is_empty();

        debug!(
            "Heuristic divergence: {} candidates, {} unmatched, confidence {:.2}, detected {}",
            candidates.len(),
            unmatched.len(),
            confidence,
            detected
        );

        HeuristicDivergence {
            detected,
            confidence,
            gaps,
            unmatched_entities,
            references_seen: candidates.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DivergenceDetection for HeuristicDivergenceDetector {
    async fn detect(
        &self,
        user_input: &str,
        baseline: Option<&ContextPackage>,
        transition: Option<&PassTransition>,
    ) -> DivergenceResult {
        let (Some(baseline), Some(transition)) = (baseline, transition) else {
            return DivergenceResult::Heuristic(HeuristicDivergence::default());
        };
        if user_input.trim().is_empty() {
            return DivergenceResult::Heuristic(HeuristicDivergence::default());
        }
        DivergenceResult::Heuristic(self.evaluate(user_input, baseline, transition))
    }
}

fn alphabetic_runs(text: &str, min_len: usize) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphabetic())
        .filter(move |run| run.chars().count() >= min_len)
        .map(str::to_lowercase)
}

/// Known as a whole, or by a trailing run of at least two words
fn phrase_known(phrase: &str, known: &HashSet<String>) -> bool {
    let words: Vec<&str> = phrase.split(' ').collect();
    (0..words.len().saturating_sub(1)).any(|start| known.contains(&words[start..].join(" ")))
}
