//! Task decomposition: free text in, validated subtask DAG out.
//!
//! Three stages, each a fallback for the one before it:
//! 1. LLM call under a wall-clock budget, output parsed as a JSON list.
//! 2. Rule-based template matching on the description keywords.
//! 3. A single-subtask decomposition carrying the original description.
//!
//! Whatever the path, the result is a non-empty, acyclic, validated DAG.
//! The only error surfaced upstream is malformed caller input.

pub mod llm;
pub mod templates;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::retry::{self, CircuitBreaker};
use llm::LlmClient;

/// One decomposed subtask, dependencies expressed as indices into the
/// containing list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub recommended_tool: Option<String>,
    #[serde(default = "default_complexity")]
    pub complexity: i32,
}

fn default_complexity() -> i32 {
    3
}

/// Errors from decomposition validation.
#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error("task description must not be empty")]
    EmptyDescription,

    #[error("decomposition produced no subtasks")]
    NoSubtasks,

    #[error("subtask {index} is missing a {field}")]
    MissingField { index: usize, field: &'static str },

    #[error("duplicate subtask name: {0:?}")]
    DuplicateName(String),

    #[error("subtask {index} depends on out-of-range index {dependency} (len {len})")]
    DependencyOutOfRange {
        index: usize,
        dependency: usize,
        len: usize,
    },

    #[error("subtask {0} depends on itself")]
    SelfDependency(usize),

    #[error("dependency cycle detected involving subtasks: {0}")]
    CycleDetected(String),
}

/// How one LLM decomposition attempt failed.
enum LlmFailure {
    /// Transport-level: the request errored or the wall-clock budget
    /// elapsed. Counts against the circuit breaker.
    Call(String),
    /// The model answered but the answer was unusable. The call itself
    /// was healthy, so the breaker records a success.
    Output(String),
}

/// The decomposer. The LLM client is optional; without one, decomposition
/// goes straight to the rule-based fallbacks. Repeated transport failures
/// open a circuit breaker that skips the model entirely for a cool-down.
pub struct Decomposer {
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
    breaker: CircuitBreaker,
}

impl Decomposer {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, timeout: Duration) -> Self {
        Self {
            llm,
            timeout,
            breaker: CircuitBreaker::new(
                retry::DEFAULT_BREAKER_THRESHOLD,
                retry::DEFAULT_BREAKER_COOLDOWN,
            ),
        }
    }

    /// Decompose a task description into a validated subtask DAG.
    ///
    /// `preferred_tools` seed the recommended-tool hints where the
    /// decomposition leaves them unset.
    pub async fn decompose(
        &self,
        description: &str,
        requirements: &[String],
        preferred_tools: &[String],
    ) -> Result<Vec<SubtaskSpec>, DecomposeError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(DecomposeError::EmptyDescription);
        }

        if let Some(llm) = &self.llm {
            if self.breaker.allow() {
                match self.llm_decompose(llm.as_ref(), description, requirements).await {
                    Ok(specs) => {
                        self.breaker.record_success();
                        return finalize(specs, preferred_tools);
                    }
                    Err(LlmFailure::Call(reason)) => {
                        self.breaker.record_failure();
                        warn!(%reason, "LLM call failed, falling back to templates");
                    }
                    Err(LlmFailure::Output(reason)) => {
                        self.breaker.record_success();
                        warn!(%reason, "LLM output invalid, falling back to templates");
                    }
                }
            } else {
                warn!("LLM circuit breaker open, skipping the model call");
            }
        }

        let specs = templates::match_template(description)
            .unwrap_or_else(|| single_subtask(description));
        finalize(specs, preferred_tools)
    }

    async fn llm_decompose(
        &self,
        llm: &dyn LlmClient,
        description: &str,
        requirements: &[String],
    ) -> Result<Vec<SubtaskSpec>, LlmFailure> {
        let user_prompt = build_user_prompt(description, requirements);

        let raw = match tokio::time::timeout(
            self.timeout,
            llm.complete(SYSTEM_PROMPT, &user_prompt),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(LlmFailure::Call(format!("{e:#}"))),
            Err(_) => {
                return Err(LlmFailure::Call(format!(
                    "timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let specs = parse_llm_output(&raw).map_err(|e| LlmFailure::Output(e.to_string()))?;
        validate(&specs).map_err(|e| LlmFailure::Output(e.to_string()))?;
        Ok(specs)
    }
}

/// Single-subtask last-resort decomposition.
fn single_subtask(description: &str) -> Vec<SubtaskSpec> {
    vec![SubtaskSpec {
        name: "complete-task".to_owned(),
        description: description.to_owned(),
        depends_on: vec![],
        recommended_tool: None,
        complexity: 3,
    }]
}

/// Clamp complexity, fill missing tool hints, and validate.
fn finalize(
    mut specs: Vec<SubtaskSpec>,
    preferred_tools: &[String],
) -> Result<Vec<SubtaskSpec>, DecomposeError> {
    let default_tool = preferred_tools.first().cloned();
    for spec in &mut specs {
        spec.complexity = spec.complexity.clamp(1, 5);
        if spec.recommended_tool.is_none() {
            spec.recommended_tool = default_tool.clone();
        }
    }
    validate(&specs)?;
    Ok(specs)
}

/// Validate a decomposition: required fields, unique names, in-range
/// acyclic dependencies.
pub fn validate(specs: &[SubtaskSpec]) -> Result<(), DecomposeError> {
    if specs.is_empty() {
        return Err(DecomposeError::NoSubtasks);
    }

    let mut seen = HashSet::new();
    for (index, spec) in specs.iter().enumerate() {
        if spec.name.trim().is_empty() {
            return Err(DecomposeError::MissingField {
                index,
                field: "name",
            });
        }
        if spec.description.trim().is_empty() {
            return Err(DecomposeError::MissingField {
                index,
                field: "description",
            });
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(DecomposeError::DuplicateName(spec.name.clone()));
        }
        for &dep in &spec.depends_on {
            if dep >= specs.len() {
                return Err(DecomposeError::DependencyOutOfRange {
                    index,
                    dependency: dep,
                    len: specs.len(),
                });
            }
            if dep == index {
                return Err(DecomposeError::SelfDependency(index));
            }
        }
    }

    check_for_cycles(specs)
}

/// Cycle detection via iterative depth-first traversal with three-color
/// marking over the index graph.
fn check_for_cycles(specs: &[SubtaskSpec]) -> Result<(), DecomposeError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let n = specs.len();
    let mut color = vec![Color::White; n];

    for start in 0..n {
        if color[start] != Color::White {
            continue;
        }
        // Stack of (node, next dependency index to visit).
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        color[start] = Color::Gray;

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            if frame.1 < specs[node].depends_on.len() {
                let dep = specs[node].depends_on[frame.1];
                frame.1 += 1;
                match color[dep] {
                    Color::White => {
                        color[dep] = Color::Gray;
                        stack.push((dep, 0));
                    }
                    Color::Gray => {
                        let members: Vec<&str> = stack
                            .iter()
                            .map(|&(i, _)| specs[i].name.as_str())
                            .collect();
                        return Err(DecomposeError::CycleDetected(members.join(", ")));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// LLM prompt and output parsing
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT: &str = "\
You are a planning assistant that decomposes a software task into subtasks.

Respond with ONLY a JSON array. Each element:
{
  \"name\": \"kebab-case-identifier\",
  \"description\": \"what the worker should do\",
  \"depends_on\": [0, 1],
  \"recommended_tool\": \"claude\",
  \"complexity\": 3
}

Rules:
- depends_on holds ZERO-BASED INDICES into this same array.
- The dependency graph must be acyclic.
- complexity is an integer from 1 (trivial) to 5 (hard).
- Between 1 and 10 subtasks. Prefer parallelizable structure.
- No prose outside the JSON array.";

fn build_user_prompt(description: &str, requirements: &[String]) -> String {
    let mut prompt = format!("Decompose this task into subtasks:\n\n{description}\n");
    if !requirements.is_empty() {
        prompt.push_str("\nRequirements:\n");
        for requirement in requirements {
            prompt.push_str(&format!("- {requirement}\n"));
        }
    }
    prompt
}

/// Extract the JSON array from an LLM response, tolerating code fences and
/// surrounding prose.
fn parse_llm_output(raw: &str) -> Result<Vec<SubtaskSpec>, DecomposeError> {
    let start = raw.find('[');
    let end = raw.rfind(']');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => return Err(DecomposeError::NoSubtasks),
    };

    let specs: Vec<SubtaskSpec> =
        serde_json::from_str(json).map_err(|_| DecomposeError::NoSubtasks)?;
    if specs.is_empty() {
        return Err(DecomposeError::NoSubtasks);
    }
    Ok(specs)
}
