use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `Completed`, `Failed`, and `Cancelled` are absorbing: no transition
/// leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Initializing,
    Running,
    CheckpointPending,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (absorbing).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::CheckpointPending => "checkpoint_pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "initializing" => Ok(Self::Initializing),
            "running" => Ok(Self::Running),
            "checkpoint_pending" => Ok(Self::CheckpointPending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StatusParseError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Ready,
    Assigned,
    Running,
    Completed,
    Failed,
    Correcting,
}

impl SubtaskStatus {
    /// Whether the subtask still occupies a worker slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Correcting => "correcting",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "correcting" => Ok(Self::Correcting),
            other => Err(StatusParseError::new("subtask status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of a subtask.
///
/// `Review` and `Correction` subtasks carry a `review_target` pointing at
/// the work subtask they evaluate or fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubtaskKind {
    Work,
    Review,
    Correction,
}

impl fmt::Display for SubtaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Work => "work",
            Self::Review => "review",
            Self::Correction => "correction",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskKind {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "work" => Ok(Self::Work),
            "review" => Ok(Self::Review),
            "correction" => Ok(Self::Correction),
            other => Err(StatusParseError::new("subtask kind", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Liveness state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Busy,
    Offline,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(StatusParseError::new("worker status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Where a worker runs, relative to the submitting organization.
///
/// Sensitive tasks prefer `Local` workers during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerResidency {
    Local,
    Remote,
}

impl fmt::Display for WorkerResidency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Remote => "remote",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerResidency {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(StatusParseError::new("worker residency", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a human-review checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    PendingReview,
    Approved,
    Corrected,
    Rejected,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Corrected => "corrected",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_review" => Ok(Self::PendingReview),
            "approved" => Ok(Self::Approved),
            "corrected" => Ok(Self::Corrected),
            "rejected" => Ok(Self::Rejected),
            other => Err(StatusParseError::new("checkpoint status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Why a checkpoint was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Frequency,
    LowScore,
    PeerReviewIssues,
    ReviewEscalation,
}

impl fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Frequency => "frequency",
            Self::LowScore => "low_score",
            Self::PeerReviewIssues => "peer_review_issues",
            Self::ReviewEscalation => "review_escalation",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointReason {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "frequency" => Ok(Self::Frequency),
            "low_score" => Ok(Self::LowScore),
            "peer_review_issues" => Ok(Self::PeerReviewIssues),
            "review_escalation" => Ok(Self::ReviewEscalation),
            other => Err(StatusParseError::new("checkpoint reason", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// How often a task pauses for human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFrequency {
    Low,
    Medium,
    High,
}

impl fmt::Display for CheckpointFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointFrequency {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(StatusParseError::new("checkpoint frequency", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Privacy level of a task -- drives worker residency preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Normal,
    Sensitive,
}

impl fmt::Display for PrivacyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Sensitive => "sensitive",
        };
        f.write_str(s)
    }
}

impl FromStr for PrivacyLevel {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "sensitive" => Ok(Self::Sensitive),
            other => Err(StatusParseError::new("privacy level", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Outcome of a peer review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    NeedsRevision,
    Escalate,
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approved => "approved",
            Self::NeedsRevision => "needs_revision",
            Self::Escalate => "escalate",
        };
        f.write_str(s)
    }
}

impl FromStr for ReviewDecision {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "needs_revision" => Ok(Self::NeedsRevision),
            "escalate" => Ok(Self::Escalate),
            other => Err(StatusParseError::new("review decision", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// User-supplied classification of a correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CorrectionCategory {
    WrongApproach,
    Incomplete,
    Bug,
    Style,
    MissingFeature,
    Other,
}

impl fmt::Display for CorrectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WrongApproach => "wrong_approach",
            Self::Incomplete => "incomplete",
            Self::Bug => "bug",
            Self::Style => "style",
            Self::MissingFeature => "missing_feature",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for CorrectionCategory {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wrong_approach" => Ok(Self::WrongApproach),
            "incomplete" => Ok(Self::Incomplete),
            "bug" => Ok(Self::Bug),
            "style" => Ok(Self::Style),
            "missing_feature" => Ok(Self::MissingFeature),
            "other" => Ok(Self::Other),
            other => Err(StatusParseError::new("correction category", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Result of applying a correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CorrectionOutcome {
    Pending,
    Success,
    Failed,
}

impl fmt::Display for CorrectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for CorrectionOutcome {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError::new("correction outcome", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Parse error
// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid status string.
#[derive(Debug, Clone)]
pub struct StatusParseError {
    what: &'static str,
    value: String,
}

impl StatusParseError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.what, self.value)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the top-level unit of work submitted by a human.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub checkpoint_frequency: CheckpointFrequency,
    pub privacy: PrivacyLevel,
    /// Preferred tool identifiers, serialized as a JSON array of strings.
    pub preferred_tools: serde_json::Value,
    pub status: TaskStatus,
    /// Derived from completed subtasks, in [0, 100].
    pub progress: i32,
    /// Monotonic counter for optimistic locking. Every update bumps it.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A subtask -- one node of a task's DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub kind: SubtaskKind,
    pub name: String,
    pub description: String,
    pub status: SubtaskStatus,
    pub recommended_tool: Option<String>,
    pub assigned_worker: Option<Uuid>,
    /// Estimated complexity in [1, 5].
    pub complexity: i32,
    pub priority: i32,
    /// Opaque structured result blob: files, text, usage.
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Latest aggregate evaluation score, if evaluated.
    pub score: Option<f64>,
    /// Completed review cycles charged against the per-subtask ceiling.
    pub review_cycles: i32,
    /// For Review/Correction kinds: the work subtask being targeted.
    pub review_target: Option<Uuid>,
    pub retries: i32,
    /// Dispatch attempt index; part of the result idempotency key.
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An edge in a task's subtask dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubtaskDependency {
    pub subtask_id: Uuid,
    pub depends_on: Uuid,
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worker {
    pub id: Uuid,
    pub machine_name: String,
    /// Tool identifiers this worker can run, as a JSON array of strings.
    pub capabilities: serde_json::Value,
    pub residency: WorkerResidency,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    pub status: WorkerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    /// Soft-delete marker set on deregistration.
    pub deregistered_at: Option<DateTime<Utc>>,
}

impl Worker {
    /// Parse the capabilities JSON into a list of tool ids.
    pub fn tool_ids(&self) -> Vec<String> {
        self.capabilities
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A human-review checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub id: Uuid,
    pub task_id: Uuid,
    pub reason: CheckpointReason,
    /// Completed subtask ids, aggregate score, next subtasks, open issues.
    pub snapshot: serde_json::Value,
    pub status: CheckpointStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// A peer-review record linking an original subtask to its review subtask.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Review {
    pub id: Uuid,
    pub subtask_id: Uuid,
    pub review_subtask_id: Uuid,
    pub reviewer_worker: Option<Uuid>,
    pub author_worker: Option<Uuid>,
    pub score: Option<f64>,
    /// Severity-classified issues, as a JSON array.
    pub issues: serde_json::Value,
    pub decision: Option<ReviewDecision>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// A quality evaluation of one subtask's output.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Evaluation {
    pub id: Uuid,
    pub subtask_id: Uuid,
    /// Map of dimension name to score in [0, 10].
    pub dimension_scores: serde_json::Value,
    /// Weight-normalized overall score in [0, 10].
    pub overall: f64,
    /// Structured issues and suggestions.
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A correction requested by a human checkpoint decision or a peer review.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Correction {
    pub id: Uuid,
    /// Set when the correction came from a checkpoint decision.
    pub checkpoint_id: Option<Uuid>,
    pub subtask_id: Uuid,
    pub category: CorrectionCategory,
    pub guidance: String,
    pub outcome: CorrectionOutcome,
    pub retry_index: i32,
    pub learning_mode: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// An append-only activity log row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityLog {
    pub id: i64,
    pub task_id: Option<Uuid>,
    pub subtask_id: Option<Uuid>,
    pub worker_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
