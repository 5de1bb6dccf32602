//! Peer-review policy: when to review, how to read a verdict, what to do
//! with it.
//!
//! The decision logic is pure so it can be tested exhaustively; the
//! orchestrator owns the side effects (spawning review and correction
//! subtasks, raising checkpoints).

use serde::{Deserialize, Serialize};

use conductor_db::models::Subtask;

/// Severity of an issue raised by a reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// One issue from a review verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: IssueSeverity,
    pub description: String,
}

/// The structured verdict a review subtask must emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    /// In [0, 10].
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub auto_fix_feasible: bool,
    #[serde(default)]
    pub suggested_fix: Option<String>,
}

impl ReviewVerdict {
    /// Whether the verdict raised any critical issue.
    pub fn has_critical(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity == IssueSeverity::Critical)
    }

    /// Whether the verdict raised any critical or high issue.
    pub fn has_critical_or_high(&self) -> bool {
        self.issues.iter().any(|issue| {
            matches!(issue.severity, IssueSeverity::Critical | IssueSeverity::High)
        })
    }
}

/// What the controller does with a finished review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewAction {
    /// Accept the original subtask's output as-is.
    Accept,
    /// Spawn a correction subtask against the original author.
    Correct,
    /// Raise a checkpoint with reason peer-review-issues.
    Checkpoint,
}

/// Review trigger and decision thresholds.
#[derive(Debug, Clone, Copy)]
pub struct ReviewPolicy {
    /// Shared ceiling on review cycles per original subtask.
    pub max_cycles: i32,
    /// Minimum score at which auto-fix corrections are allowed.
    pub auto_fix_score_floor: f64,
}

impl ReviewPolicy {
    /// Whether a completed work subtask triggers a peer review.
    ///
    /// - complexity >= 4: always, regardless of score.
    /// - complexity == 3: always.
    /// - complexity <= 2: only when the evaluation score sits in [7, 9);
    ///   a score of 9 or above skips review, and lower scores are left to
    ///   the low-score checkpoint trigger.
    pub fn should_review(&self, complexity: i32, score: Option<f64>) -> bool {
        if complexity >= 3 {
            return true;
        }
        match score {
            Some(score) => (7.0..9.0).contains(&score),
            None => false,
        }
    }

    /// Whether the cycle budget for this subtask is spent.
    pub fn cycles_exhausted(&self, review_cycles: i32) -> bool {
        review_cycles >= self.max_cycles
    }

    /// Decide what to do with a parsed verdict.
    ///
    /// - score >= 8 with no critical or high issues: accept.
    /// - auto-fix feasible, no critical issues, score at or above the
    ///   floor, and cycles remaining: correct.
    /// - anything else: checkpoint.
    pub fn decide(&self, verdict: &ReviewVerdict, review_cycles: i32) -> ReviewAction {
        if verdict.score >= 8.0 && !verdict.has_critical_or_high() {
            return ReviewAction::Accept;
        }
        if verdict.auto_fix_feasible
            && !verdict.has_critical()
            && verdict.score >= self.auto_fix_score_floor
            && !self.cycles_exhausted(review_cycles)
        {
            return ReviewAction::Correct;
        }
        ReviewAction::Checkpoint
    }
}

/// Parse a review subtask's output blob into a verdict.
///
/// The verdict may sit at the top level of the output or under a
/// `"verdict"` key; the `"text"` field is tried as embedded JSON last.
pub fn parse_verdict(output: &serde_json::Value) -> Option<ReviewVerdict> {
    if let Ok(verdict) = serde_json::from_value::<ReviewVerdict>(output.clone()) {
        return Some(verdict);
    }
    if let Some(nested) = output.get("verdict")
        && let Ok(verdict) = serde_json::from_value::<ReviewVerdict>(nested.clone())
    {
        return Some(verdict);
    }
    if let Some(text) = output.get("text").and_then(|v| v.as_str()) {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if start < end
            && let Ok(verdict) = serde_json::from_str::<ReviewVerdict>(&text[start..=end])
        {
            return Some(verdict);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

const REVIEWER_INSTRUCTIONS: &str = "\
You are reviewing another worker's output. Evaluate it against the original \
subtask description. Respond with ONLY a JSON object:
{
  \"score\": 0.0-10.0,
  \"issues\": [{\"severity\": \"critical|high|medium|low\", \"description\": \"...\"}],
  \"auto_fix_feasible\": true,
  \"suggested_fix\": \"concrete instructions, or null\"
}";

/// Build the description for a review subtask.
pub fn build_review_prompt(original: &Subtask) -> String {
    let artifacts = original
        .output
        .as_ref()
        .map(|output| serde_json::to_string_pretty(output).unwrap_or_default())
        .unwrap_or_else(|| "(no output recorded)".to_owned());

    format!(
        "{REVIEWER_INSTRUCTIONS}\n\n\
         ## Original subtask\n\n{description}\n\n\
         ## Generated artifacts\n\n{artifacts}\n",
        description = original.description,
    )
}

/// Build the description for a correction subtask.
pub fn build_correction_prompt(original: &Subtask, guidance: &str) -> String {
    format!(
        "Apply the following fixes to your earlier work on this subtask.\n\n\
         ## Original subtask\n\n{description}\n\n\
         ## Required fixes\n\n{guidance}\n\n\
         Preserve everything that was already correct; change only what the \
         fixes require.",
        description = original.description,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReviewPolicy {
        ReviewPolicy {
            max_cycles: 3,
            auto_fix_score_floor: 6.0,
        }
    }

    fn verdict(score: f64, severities: &[IssueSeverity], auto_fix: bool) -> ReviewVerdict {
        ReviewVerdict {
            score,
            issues: severities
                .iter()
                .map(|&severity| ReviewIssue {
                    severity,
                    description: "issue".to_owned(),
                })
                .collect(),
            auto_fix_feasible: auto_fix,
            suggested_fix: auto_fix.then(|| "fix it".to_owned()),
        }
    }

    #[test]
    fn high_complexity_always_reviews() {
        // Even a perfect score does not skip review at complexity 5.
        assert!(policy().should_review(5, Some(10.0)));
        assert!(policy().should_review(4, Some(10.0)));
    }

    #[test]
    fn complexity_three_always_reviews() {
        assert!(policy().should_review(3, None));
        assert!(policy().should_review(3, Some(9.5)));
    }

    #[test]
    fn low_complexity_reviews_only_mid_scores() {
        let policy = policy();
        assert!(policy.should_review(2, Some(7.0)));
        assert!(policy.should_review(2, Some(8.9)));
        assert!(!policy.should_review(2, Some(9.0)));
        assert!(!policy.should_review(1, Some(9.5)));
        // Below the band: left to the low-score checkpoint.
        assert!(!policy.should_review(2, Some(6.5)));
        // No score signal, no review.
        assert!(!policy.should_review(2, None));
    }

    #[test]
    fn cycle_ceiling() {
        let policy = policy();
        assert!(!policy.cycles_exhausted(2));
        assert!(policy.cycles_exhausted(3));
        assert!(policy.cycles_exhausted(4));
    }

    #[test]
    fn good_verdict_accepts() {
        let action = policy().decide(&verdict(9.0, &[IssueSeverity::Low], false), 0);
        assert_eq!(action, ReviewAction::Accept);
    }

    #[test]
    fn high_issue_blocks_acceptance() {
        let action = policy().decide(&verdict(9.0, &[IssueSeverity::High], false), 0);
        assert_eq!(action, ReviewAction::Checkpoint);
    }

    #[test]
    fn fixable_verdict_corrects() {
        // Scenario: score 6.5, auto-fix feasible, no critical issues,
        // cycle count 0 -> spawn a correction.
        let action = policy().decide(&verdict(6.5, &[IssueSeverity::Medium], true), 0);
        assert_eq!(action, ReviewAction::Correct);
    }

    #[test]
    fn critical_issue_blocks_autofix() {
        let action = policy().decide(&verdict(6.5, &[IssueSeverity::Critical], true), 0);
        assert_eq!(action, ReviewAction::Checkpoint);
    }

    #[test]
    fn score_below_floor_blocks_autofix() {
        let action = policy().decide(&verdict(5.0, &[], true), 0);
        assert_eq!(action, ReviewAction::Checkpoint);
    }

    #[test]
    fn exhausted_cycles_block_autofix() {
        // The correction would be cycle 3 of 3; fall through to checkpoint.
        let action = policy().decide(&verdict(6.5, &[], true), 2);
        assert_eq!(action, ReviewAction::Correct);
        let action = policy().decide(&verdict(6.5, &[], true), 3);
        assert_eq!(action, ReviewAction::Checkpoint);
    }

    #[test]
    fn parse_verdict_top_level() {
        let output = serde_json::json!({
            "score": 8.5,
            "issues": [{"severity": "low", "description": "nit"}],
            "auto_fix_feasible": false
        });
        let verdict = parse_verdict(&output).expect("should parse");
        assert_eq!(verdict.score, 8.5);
        assert_eq!(verdict.issues.len(), 1);
    }

    #[test]
    fn parse_verdict_nested_key() {
        let output = serde_json::json!({
            "files": [],
            "verdict": {"score": 4.0, "auto_fix_feasible": true}
        });
        let verdict = parse_verdict(&output).expect("should parse");
        assert_eq!(verdict.score, 4.0);
        assert!(verdict.auto_fix_feasible);
    }

    #[test]
    fn parse_verdict_embedded_in_text() {
        let output = serde_json::json!({
            "files": [],
            "text": "Review complete.\n{\"score\": 7.0, \"issues\": []}\nDone."
        });
        let verdict = parse_verdict(&output).expect("should parse");
        assert_eq!(verdict.score, 7.0);
    }

    #[test]
    fn parse_verdict_garbage_is_none() {
        assert!(parse_verdict(&serde_json::json!({"text": "no json here"})).is_none());
        assert!(parse_verdict(&serde_json::json!(null)).is_none());
    }

    #[test]
    fn severity_helpers() {
        assert!(verdict(5.0, &[IssueSeverity::Critical], false).has_critical());
        assert!(!verdict(5.0, &[IssueSeverity::High], false).has_critical());
        assert!(verdict(5.0, &[IssueSeverity::High], false).has_critical_or_high());
        assert!(!verdict(5.0, &[IssueSeverity::Medium], false).has_critical_or_high());
    }
}
