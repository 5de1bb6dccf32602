//! Evaluator pipeline: pluggable per-dimension scorers with weighted
//! aggregation.
//!
//! Evaluators live in a table keyed by dimension; the weight belongs to
//! the table entry, not the evaluator. Applicable evaluators run
//! concurrently under a per-call timeout. Aggregation normalizes over the
//! dimensions that actually produced a score: a missing dimension
//! contributes zero weight, not a zero score.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;

use conductor_db::models::Subtask;

use crate::config::{CoreConfig, WEIGHT_EPSILON};
use crate::error::{CoreError, CoreResult};
use crate::retry::{self, CircuitBreaker};

/// Score and findings for one dimension.
#[derive(Debug, Clone)]
pub struct DimensionScore {
    /// In [0, 10].
    pub score: f64,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

/// A single-dimension evaluator.
///
/// Evaluators are side-effect-free from the orchestrator's view; they may
/// call external tools but must finish within the pipeline timeout.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// The dimension this evaluator scores.
    fn dimension(&self) -> &str;

    /// Whether this evaluator applies to the given subtask.
    fn applies(&self, subtask: &Subtask) -> bool;

    async fn evaluate(&self, subtask: &Subtask) -> anyhow::Result<DimensionScore>;
}

/// A table entry: the weight lives here, next to the evaluator.
pub struct EvaluatorEntry {
    pub weight: f64,
    pub evaluator: Box<dyn Evaluator>,
}

/// Aggregated outcome over all applicable dimensions.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub dimension_scores: BTreeMap<String, f64>,
    /// Weight-normalized overall score in [0, 10].
    pub overall: f64,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

/// The pipeline: a validated evaluator table, the per-call timeout, and
/// a circuit breaker that skips evaluation while scorers are unhealthy.
pub struct EvaluatorPipeline {
    entries: Vec<EvaluatorEntry>,
    timeout: Duration,
    breaker: CircuitBreaker,
}

impl EvaluatorPipeline {
    /// Build a pipeline, rejecting weight sets that do not sum to 1.
    pub fn new(entries: Vec<EvaluatorEntry>, timeout: Duration) -> CoreResult<Self> {
        if entries.is_empty() {
            return Err(CoreError::validation("evaluator table must not be empty"));
        }
        let sum: f64 = entries.iter().map(|entry| entry.weight).sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(CoreError::validation(format!(
                "evaluator weights must sum to 1, got {sum}"
            )));
        }
        Ok(Self {
            entries,
            timeout,
            breaker: CircuitBreaker::new(
                retry::DEFAULT_BREAKER_THRESHOLD,
                retry::DEFAULT_BREAKER_COOLDOWN,
            ),
        })
    }

    /// Run every applicable evaluator concurrently and aggregate.
    ///
    /// Returns `None` when no evaluator applies to the subtask, or when
    /// the breaker is open. An evaluator that errors or times out drops
    /// out of the aggregation (zero weight), matching the
    /// missing-dimension rule, and counts against the breaker.
    pub async fn run(&self, subtask: &Subtask) -> Option<EvaluationOutcome> {
        if !self.breaker.allow() {
            warn!("evaluator circuit breaker open, skipping evaluation");
            return None;
        }

        let applicable: Vec<&EvaluatorEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.evaluator.applies(subtask))
            .collect();

        if applicable.is_empty() {
            return None;
        }

        let runs = applicable.iter().map(|entry| async {
            let dimension = entry.evaluator.dimension().to_owned();
            let result =
                tokio::time::timeout(self.timeout, entry.evaluator.evaluate(subtask)).await;
            match result {
                Ok(Ok(score)) => {
                    self.breaker.record_success();
                    Some((dimension, entry.weight, score))
                }
                Ok(Err(error)) => {
                    self.breaker.record_failure();
                    warn!(%dimension, %error, "evaluator failed, dropping dimension");
                    None
                }
                Err(_) => {
                    self.breaker.record_failure();
                    warn!(%dimension, "evaluator timed out, dropping dimension");
                    None
                }
            }
        });

        let scored: Vec<(String, f64, DimensionScore)> =
            join_all(runs).await.into_iter().flatten().collect();

        if scored.is_empty() {
            return None;
        }

        let mut dimension_scores = BTreeMap::new();
        let mut issues = Vec::new();
        let mut suggestions = Vec::new();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;

        for (dimension, weight, score) in scored {
            let clamped = score.score.clamp(0.0, 10.0);
            weighted_sum += weight * clamped;
            weight_total += weight;
            dimension_scores.insert(dimension, clamped);
            issues.extend(score.issues);
            suggestions.extend(score.suggestions);
        }

        let overall = (weighted_sum / weight_total).clamp(0.0, 10.0);

        Some(EvaluationOutcome {
            dimension_scores,
            overall,
            issues,
            suggestions,
        })
    }
}

// ---------------------------------------------------------------------------
// Built-in evaluators
// ---------------------------------------------------------------------------

/// Checks that the output blob exists and carries non-empty artifacts.
pub struct CompletenessEvaluator;

#[async_trait]
impl Evaluator for CompletenessEvaluator {
    fn dimension(&self) -> &str {
        "completeness"
    }

    fn applies(&self, _subtask: &Subtask) -> bool {
        true
    }

    async fn evaluate(&self, subtask: &Subtask) -> anyhow::Result<DimensionScore> {
        let Some(output) = &subtask.output else {
            return Ok(DimensionScore {
                score: 0.0,
                issues: vec!["subtask produced no output".to_owned()],
                suggestions: vec!["re-run the subtask or inspect the worker log".to_owned()],
            });
        };

        let files = output
            .get("files")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let text_len = output
            .get("text")
            .and_then(|v| v.as_str())
            .map(str::len)
            .unwrap_or(0);

        let mut score: f64 = 4.0;
        let mut issues = Vec::new();
        if files > 0 {
            score += 4.0;
        } else {
            issues.push("output lists no files".to_owned());
        }
        if text_len > 0 {
            score += 2.0;
        } else {
            issues.push("output has no summary text".to_owned());
        }

        Ok(DimensionScore {
            score: score.min(10.0),
            issues,
            suggestions: vec![],
        })
    }
}

/// Checks that the output blob is shaped as expected.
pub struct StructureEvaluator;

#[async_trait]
impl Evaluator for StructureEvaluator {
    fn dimension(&self) -> &str {
        "structure"
    }

    fn applies(&self, subtask: &Subtask) -> bool {
        subtask.output.is_some()
    }

    async fn evaluate(&self, subtask: &Subtask) -> anyhow::Result<DimensionScore> {
        let Some(output) = subtask.output.as_ref() else {
            return Ok(DimensionScore {
                score: 0.0,
                issues: vec!["subtask produced no output".to_owned()],
                suggestions: vec![],
            });
        };

        let mut score: f64 = 10.0;
        let mut issues = Vec::new();

        if !output.is_object() {
            return Ok(DimensionScore {
                score: 2.0,
                issues: vec!["output is not a JSON object".to_owned()],
                suggestions: vec![
                    "workers should emit {files, text, usage} objects".to_owned()
                ],
            });
        }
        for field in ["files", "text"] {
            if output.get(field).is_none() {
                score -= 3.0;
                issues.push(format!("output is missing the {field:?} field"));
            }
        }

        Ok(DimensionScore {
            score: score.max(0.0),
            issues,
            suggestions: vec![],
        })
    }
}

/// Penalizes error text and malformed usage accounting.
pub struct ErrorHygieneEvaluator;

#[async_trait]
impl Evaluator for ErrorHygieneEvaluator {
    fn dimension(&self) -> &str {
        "error_hygiene"
    }

    fn applies(&self, _subtask: &Subtask) -> bool {
        true
    }

    async fn evaluate(&self, subtask: &Subtask) -> anyhow::Result<DimensionScore> {
        let mut score: f64 = 10.0;
        let mut issues = Vec::new();

        if let Some(error) = &subtask.error
            && !error.is_empty()
        {
            score -= 6.0;
            issues.push(format!("subtask carries error text: {error}"));
        }
        if subtask.retries > 0 {
            score -= f64::from(subtask.retries);
            issues.push(format!("subtask needed {} retries", subtask.retries));
        }

        Ok(DimensionScore {
            score: score.max(0.0),
            issues,
            suggestions: vec![],
        })
    }
}

/// Build the default pipeline from configured weights.
///
/// Unknown dimension names in the config are rejected; the three built-in
/// dimensions are `completeness`, `structure`, and `error_hygiene`.
pub fn default_pipeline(config: &CoreConfig) -> CoreResult<EvaluatorPipeline> {
    let mut entries = Vec::new();
    for (dimension, weight) in &config.evaluator_weights {
        let evaluator: Box<dyn Evaluator> = match dimension.as_str() {
            "completeness" => Box::new(CompletenessEvaluator),
            "structure" => Box::new(StructureEvaluator),
            "error_hygiene" => Box::new(ErrorHygieneEvaluator),
            other => {
                return Err(CoreError::validation(format!(
                    "unknown evaluator dimension {other:?}"
                )));
            }
        };
        entries.push(EvaluatorEntry {
            weight: *weight,
            evaluator,
        });
    }
    EvaluatorPipeline::new(entries, config.evaluator_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conductor_db::models::{SubtaskKind, SubtaskStatus};
    use uuid::Uuid;

    fn subtask_with_output(output: Option<serde_json::Value>) -> Subtask {
        Subtask {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            kind: SubtaskKind::Work,
            name: "test".to_owned(),
            description: "test".to_owned(),
            status: SubtaskStatus::Completed,
            recommended_tool: None,
            assigned_worker: None,
            complexity: 3,
            priority: 0,
            output,
            error: None,
            score: None,
            review_cycles: 0,
            review_target: None,
            retries: 0,
            attempt: 1,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    struct FixedEvaluator {
        dimension: &'static str,
        score: f64,
    }

    #[async_trait]
    impl Evaluator for FixedEvaluator {
        fn dimension(&self) -> &str {
            self.dimension
        }

        fn applies(&self, _subtask: &Subtask) -> bool {
            true
        }

        async fn evaluate(&self, _subtask: &Subtask) -> anyhow::Result<DimensionScore> {
            Ok(DimensionScore {
                score: self.score,
                issues: vec![],
                suggestions: vec![],
            })
        }
    }

    struct NeverApplies;

    #[async_trait]
    impl Evaluator for NeverApplies {
        fn dimension(&self) -> &str {
            "never"
        }

        fn applies(&self, _subtask: &Subtask) -> bool {
            false
        }

        async fn evaluate(&self, _subtask: &Subtask) -> anyhow::Result<DimensionScore> {
            unreachable!("never applies")
        }
    }

    struct FailingEvaluator;

    #[async_trait]
    impl Evaluator for FailingEvaluator {
        fn dimension(&self) -> &str {
            "failing"
        }

        fn applies(&self, _subtask: &Subtask) -> bool {
            true
        }

        async fn evaluate(&self, _subtask: &Subtask) -> anyhow::Result<DimensionScore> {
            anyhow::bail!("external tool crashed")
        }
    }

    fn entry(weight: f64, evaluator: impl Evaluator + 'static) -> EvaluatorEntry {
        EvaluatorEntry {
            weight,
            evaluator: Box::new(evaluator),
        }
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let result = EvaluatorPipeline::new(
            vec![
                entry(0.5, FixedEvaluator { dimension: "a", score: 5.0 }),
                entry(0.4, FixedEvaluator { dimension: "b", score: 5.0 }),
            ],
            Duration::from_secs(30),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn weighted_aggregation() {
        let pipeline = EvaluatorPipeline::new(
            vec![
                entry(0.75, FixedEvaluator { dimension: "a", score: 8.0 }),
                entry(0.25, FixedEvaluator { dimension: "b", score: 4.0 }),
            ],
            Duration::from_secs(30),
        )
        .unwrap();

        let outcome = pipeline
            .run(&subtask_with_output(Some(serde_json::json!({}))))
            .await
            .expect("should produce an outcome");

        assert!((outcome.overall - 7.0).abs() < 1e-9);
        assert_eq!(outcome.dimension_scores["a"], 8.0);
        assert_eq!(outcome.dimension_scores["b"], 4.0);
    }

    #[tokio::test]
    async fn missing_dimension_contributes_zero_weight() {
        // "never" does not apply; overall should be driven entirely by "a",
        // not dragged down by a phantom zero.
        let pipeline = EvaluatorPipeline::new(
            vec![
                entry(0.5, FixedEvaluator { dimension: "a", score: 9.0 }),
                entry(0.5, NeverApplies),
            ],
            Duration::from_secs(30),
        )
        .unwrap();

        let outcome = pipeline
            .run(&subtask_with_output(None))
            .await
            .expect("should produce an outcome");

        assert!((outcome.overall - 9.0).abs() < 1e-9);
        assert!(!outcome.dimension_scores.contains_key("never"));
    }

    #[tokio::test]
    async fn failed_evaluator_drops_out() {
        let pipeline = EvaluatorPipeline::new(
            vec![
                entry(0.5, FixedEvaluator { dimension: "a", score: 6.0 }),
                entry(0.5, FailingEvaluator),
            ],
            Duration::from_secs(30),
        )
        .unwrap();

        let outcome = pipeline
            .run(&subtask_with_output(None))
            .await
            .expect("surviving evaluator should still produce an outcome");

        assert!((outcome.overall - 6.0).abs() < 1e-9);
    }

    struct CountingFailingEvaluator {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Evaluator for CountingFailingEvaluator {
        fn dimension(&self) -> &str {
            "counting"
        }

        fn applies(&self, _subtask: &Subtask) -> bool {
            true
        }

        async fn evaluate(&self, _subtask: &Subtask) -> anyhow::Result<DimensionScore> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            anyhow::bail!("external tool crashed")
        }
    }

    #[tokio::test]
    async fn breaker_short_circuits_persistently_failing_evaluators() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let pipeline = EvaluatorPipeline::new(
            vec![entry(
                1.0,
                CountingFailingEvaluator {
                    calls: calls.clone(),
                },
            )],
            Duration::from_secs(30),
        )
        .unwrap();

        let subtask = subtask_with_output(None);
        for _ in 0..(retry::DEFAULT_BREAKER_THRESHOLD + 3) {
            assert!(pipeline.run(&subtask).await.is_none());
        }

        assert_eq!(
            calls.load(std::sync::atomic::Ordering::SeqCst),
            retry::DEFAULT_BREAKER_THRESHOLD as usize,
            "runs past the threshold must skip the evaluator entirely"
        );
    }

    #[tokio::test]
    async fn no_applicable_evaluators_returns_none() {
        let pipeline =
            EvaluatorPipeline::new(vec![entry(1.0, NeverApplies)], Duration::from_secs(30))
                .unwrap();
        assert!(pipeline.run(&subtask_with_output(None)).await.is_none());
    }

    #[tokio::test]
    async fn completeness_scores_full_output_high() {
        let subtask = subtask_with_output(Some(serde_json::json!({
            "files": ["src/auth.rs"],
            "text": "implemented",
        })));
        let score = CompletenessEvaluator.evaluate(&subtask).await.unwrap();
        assert_eq!(score.score, 10.0);
        assert!(score.issues.is_empty());
    }

    #[tokio::test]
    async fn completeness_scores_missing_output_zero() {
        let score = CompletenessEvaluator
            .evaluate(&subtask_with_output(None))
            .await
            .unwrap();
        assert_eq!(score.score, 0.0);
        assert!(!score.issues.is_empty());
    }

    #[tokio::test]
    async fn structure_penalizes_missing_fields() {
        let subtask = subtask_with_output(Some(serde_json::json!({"files": []})));
        let score = StructureEvaluator.evaluate(&subtask).await.unwrap();
        assert_eq!(score.score, 7.0);
    }

    #[tokio::test]
    async fn error_hygiene_penalizes_retries_and_errors() {
        let mut subtask = subtask_with_output(None);
        subtask.retries = 2;
        subtask.error = Some("worker crashed".to_owned());
        let score = ErrorHygieneEvaluator.evaluate(&subtask).await.unwrap();
        assert_eq!(score.score, 2.0);
        assert_eq!(score.issues.len(), 2);
    }

    #[test]
    fn default_pipeline_builds_from_default_config() {
        let config = CoreConfig::default();
        default_pipeline(&config).expect("default weights must build");
    }

    #[test]
    fn default_pipeline_rejects_unknown_dimension() {
        let mut config = CoreConfig::default();
        config.evaluator_weights.clear();
        config.evaluator_weights.insert("vibes".to_owned(), 1.0);
        assert!(default_pipeline(&config).is_err());
    }
}
