// Matcher - best-candidate search over enrolled templates
//
// Every authentication scans every enrolled template: cost is O(number of
// enrolled accounts). That bounds the scale this engine serves; deployments
// beyond a few tens of thousands of enrollments need an index in front of
// this, not a bigger threshold.
//
// Ties are a reported failure, never a coin-flip. Authenticating the wrong
// person is worse than asking them to present again.

use crate::error::{EngineError, EngineResult};
use crate::template::TemplateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// SIMILARITY
// ============================================================================

/// Pluggable comparison capability. Scores are higher-is-closer; the
/// acceptance threshold and ambiguity margin are interpreted on whatever
/// scale the chosen function produces.
pub trait Similarity: Send + Sync {
    fn score(&self, a: &[f32], b: &[f32]) -> f64;
}

/// Cosine similarity, the default. 1.0 for identical directions.
pub struct Cosine;

impl Similarity for Cosine {
    fn score(&self, a: &[f32], b: &[f32]) -> f64 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for (x, y) in a.iter().zip(b.iter()) {
            dot += f64::from(*x) * f64::from(*y);
            norm_a += f64::from(*x) * f64::from(*x);
            norm_b += f64::from(*y) * f64::from(*y);
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

/// Euclidean distance mapped onto (0, 1]: 1 / (1 + distance)
pub struct Euclidean;

impl Similarity for Euclidean {
    fn score(&self, a: &[f32], b: &[f32]) -> f64 {
        let sum: f64 = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| {
                let d = f64::from(*x) - f64::from(*y);
                d * d
            })
            .sum();
        1.0 / (1.0 + sum.sqrt())
    }
}

/// Fraction of components with identical bit patterns. Useful for coarse
/// quantized vendor templates.
pub struct Hamming;

impl Similarity for Hamming {
    fn score(&self, a: &[f32], b: &[f32]) -> f64 {
        if a.is_empty() {
            return 0.0;
        }
        let equal = a
            .iter()
            .zip(b.iter())
            .filter(|(x, y)| x.to_bits() == y.to_bits())
            .count();
        equal as f64 / a.len() as f64
    }
}

// ============================================================================
// MATCH OUTCOME
// ============================================================================

/// Tagged result of a match attempt; never a raw sentinel score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchOutcome {
    /// Exactly one enrolled account scored above threshold and clear of
    /// the ambiguity margin
    Matched { account_id: String, score: f64 },

    /// Two or more accounts scored above threshold within the margin of
    /// the best
    Ambiguous,

    /// No enrolled account reached the acceptance threshold
    NoMatch,
}

// ============================================================================
// MATCHER
// ============================================================================

pub struct Matcher {
    store: Arc<TemplateStore>,
    similarity: Box<dyn Similarity>,
    threshold: f64,
    margin: f64,
}

impl Matcher {
    /// Matcher with the default cosine similarity
    pub fn new(store: Arc<TemplateStore>, threshold: f64, margin: f64) -> Self {
        Self::with_similarity(store, Box::new(Cosine), threshold, margin)
    }

    /// Matcher with a caller-supplied similarity function
    pub fn with_similarity(
        store: Arc<TemplateStore>,
        similarity: Box<dyn Similarity>,
        threshold: f64,
        margin: f64,
    ) -> Self {
        Matcher {
            store,
            similarity,
            threshold,
            margin,
        }
    }

    /// Compare a candidate against every enrolled template and pick the
    /// best scorer above threshold, unless a second candidate ties within
    /// the ambiguity margin.
    pub fn match_template(&self, candidate: &[f32]) -> EngineResult<MatchOutcome> {
        let expected = self.store.template_len();
        if candidate.len() != expected {
            return Err(EngineError::TemplateMismatch {
                expected,
                actual: candidate.len(),
            });
        }
        if candidate.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::InvalidTemplate(
                "non-finite component in feature vector".to_string(),
            ));
        }

        let mut best: Option<(String, f64)> = None;
        let mut runner_up: Option<f64> = None;

        // Store iteration is ordered by account id, so equal scores always
        // resolve the same way across runs
        for (account_id, template) in self.store.all()? {
            let score = self.similarity.score(candidate, &template.vector);
            match &best {
                Some((_, best_score)) if score <= *best_score => {
                    if runner_up.map_or(true, |r| score > r) {
                        runner_up = Some(score);
                    }
                }
                _ => {
                    if let Some((_, prev)) = best.take() {
                        runner_up = Some(prev.max(runner_up.unwrap_or(f64::MIN)));
                    }
                    best = Some((account_id, score));
                }
            }
        }

        let (account_id, score) = match best {
            Some(b) if b.1 >= self.threshold => b,
            Some((_, score)) => {
                debug!(best_score = score, threshold = self.threshold, "no match");
                return Ok(MatchOutcome::NoMatch);
            }
            None => return Ok(MatchOutcome::NoMatch),
        };

        if let Some(second) = runner_up {
            if second >= self.threshold && (score - second) <= self.margin {
                debug!(
                    best_score = score,
                    second_score = second,
                    margin = self.margin,
                    "ambiguous match"
                );
                return Ok(MatchOutcome::Ambiguous);
            }
        }

        debug!(account_id = %account_id, score, "matched");
        Ok(MatchOutcome::Matched { account_id, score })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn setup(vectors: &[(&str, Vec<f32>)]) -> Matcher {
        let len = vectors.first().map_or(4, |(_, v)| v.len());
        let store = Arc::new(TemplateStore::new(Storage::in_memory().unwrap(), len));
        for (id, vector) in vectors {
            store.enroll(id, vector.clone()).unwrap();
        }
        Matcher::new(store, 0.85, 0.03)
    }

    #[test]
    fn test_exact_template_matches_its_account() {
        let matcher = setup(&[
            ("alice", vec![1.0, 0.0, 0.0, 0.0]),
            ("bob", vec![0.0, 1.0, 0.0, 0.0]),
        ]);

        let outcome = matcher.match_template(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        match outcome {
            MatchOutcome::Matched { account_id, score } => {
                assert_eq!(account_id, "alice");
                assert!(score > 0.999);
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_match_is_stable_across_runs() {
        let matcher = setup(&[
            ("alice", vec![1.0, 0.1, 0.0, 0.0]),
            ("bob", vec![0.0, 1.0, 0.1, 0.0]),
        ]);

        for _ in 0..10 {
            let outcome = matcher.match_template(&[1.0, 0.1, 0.0, 0.0]).unwrap();
            assert!(matches!(
                outcome,
                MatchOutcome::Matched { ref account_id, .. } if account_id == "alice"
            ));
        }
    }

    #[test]
    fn test_below_threshold_is_no_match() {
        let matcher = setup(&[("alice", vec![1.0, 0.0, 0.0, 0.0])]);

        // Orthogonal vector: cosine 0.0, far below threshold
        let outcome = matcher.match_template(&[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(outcome, MatchOutcome::NoMatch);
    }

    #[test]
    fn test_empty_store_is_no_match() {
        let matcher = setup(&[]);
        let outcome = matcher.match_template(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(outcome, MatchOutcome::NoMatch);
    }

    #[test]
    fn test_equidistant_candidates_are_ambiguous_every_run() {
        // Two enrollments the candidate matches equally well
        let matcher = setup(&[
            ("alice", vec![1.0, 0.0, 0.0, 0.0]),
            ("bob", vec![1.0, 0.0, 0.0, 0.0]),
        ]);

        for _ in 0..10 {
            let outcome = matcher.match_template(&[1.0, 0.0, 0.0, 0.0]).unwrap();
            assert_eq!(outcome, MatchOutcome::Ambiguous);
        }
    }

    #[test]
    fn test_clear_margin_beats_runner_up() {
        let matcher = setup(&[
            ("alice", vec![1.0, 0.0, 0.0, 0.0]),
            ("bob", vec![1.0, 0.5, 0.0, 0.0]),
        ]);

        // Bob scores ~0.894 against this candidate, above threshold but well
        // outside the margin of alice's perfect score
        let outcome = matcher.match_template(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(matches!(
            outcome,
            MatchOutcome::Matched { ref account_id, .. } if account_id == "alice"
        ));
    }

    #[test]
    fn test_candidate_dimension_checked() {
        let matcher = setup(&[("alice", vec![1.0, 0.0, 0.0, 0.0])]);
        let result = matcher.match_template(&[1.0, 0.0]);
        assert_eq!(
            result,
            Err(EngineError::TemplateMismatch {
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn test_euclidean_similarity() {
        let sim = Euclidean;
        assert_eq!(sim.score(&[1.0, 1.0], &[1.0, 1.0]), 1.0);
        let far = sim.score(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((far - 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_hamming_similarity() {
        let sim = Hamming;
        assert_eq!(sim.score(&[1.0, 2.0, 3.0, 4.0], &[1.0, 2.0, 0.0, 4.0]), 0.75);
        assert_eq!(sim.score(&[], &[]), 0.0);
    }
}
