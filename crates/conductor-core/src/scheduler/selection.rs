//! Worker selection scoring.
//!
//! Pure functions over candidate snapshots so the policy is testable
//! without a store. Score = 0.5 * tool_match + 0.3 * resource_headroom +
//! 0.2 * privacy_fit; candidates with any resource at or above 90 % are
//! excluded; ties break by ascending load, then registration time.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use conductor_db::models::{PrivacyLevel, Worker, WorkerResidency};

/// Resource saturation threshold. Workers at or above it on any axis are
/// not scheduling candidates.
pub const SATURATION_PCT: f64 = 90.0;

/// A selectable worker snapshot.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: Uuid,
    pub tools: Vec<String>,
    pub residency: WorkerResidency,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    /// Count of non-terminal subtasks currently assigned.
    pub load: i64,
    pub registered_at: DateTime<Utc>,
}

impl Candidate {
    pub fn from_worker(worker: &Worker, load: i64) -> Self {
        Self {
            id: worker.id,
            tools: worker.tool_ids(),
            residency: worker.residency,
            cpu_pct: worker.cpu_pct,
            mem_pct: worker.mem_pct,
            disk_pct: worker.disk_pct,
            load,
            registered_at: worker.registered_at,
        }
    }
}

/// What the subtask asks of a worker.
#[derive(Debug, Clone, Default)]
pub struct Request<'a> {
    pub recommended_tool: Option<&'a str>,
    /// The task's wider acceptable tool set.
    pub acceptable_tools: &'a [String],
    pub privacy: Option<PrivacyLevel>,
    /// Workers that must not take this subtask (e.g. the original author
    /// of a reviewed subtask).
    pub excluded: &'a [Uuid],
}

/// Tool-match component: 1.0 for the recommended tool, 0.5 for any
/// acceptable tool, 0.0 otherwise. A subtask with no tool hints accepts
/// any worker at full match.
fn tool_match(candidate: &Candidate, request: &Request<'_>) -> f64 {
    if let Some(recommended) = request.recommended_tool {
        if candidate.tools.iter().any(|tool| tool == recommended) {
            return 1.0;
        }
    } else if request.acceptable_tools.is_empty() {
        return 1.0;
    }
    if candidate
        .tools
        .iter()
        .any(|tool| request.acceptable_tools.contains(tool))
    {
        return 0.5;
    }
    0.0
}

/// Headroom component: 1 - max(cpu, mem, disk)/100, clamped to [0, 1].
fn resource_headroom(candidate: &Candidate) -> f64 {
    let peak = candidate.cpu_pct.max(candidate.mem_pct).max(candidate.disk_pct);
    (1.0 - peak / 100.0).clamp(0.0, 1.0)
}

/// Privacy-fit component: sensitive tasks match local workers at 1.0 and
/// remote ones at 0.5; normal tasks match everything.
fn privacy_fit(candidate: &Candidate, request: &Request<'_>) -> f64 {
    match request.privacy {
        Some(PrivacyLevel::Sensitive) => match candidate.residency {
            WorkerResidency::Local => 1.0,
            WorkerResidency::Remote => 0.5,
        },
        Some(PrivacyLevel::Normal) | None => 1.0,
    }
}

/// Score a candidate, or `None` when it is excluded or saturated.
pub fn score(candidate: &Candidate, request: &Request<'_>) -> Option<f64> {
    if request.excluded.contains(&candidate.id) {
        return None;
    }
    if candidate.cpu_pct >= SATURATION_PCT
        || candidate.mem_pct >= SATURATION_PCT
        || candidate.disk_pct >= SATURATION_PCT
    {
        return None;
    }
    Some(
        0.5 * tool_match(candidate, request)
            + 0.3 * resource_headroom(candidate)
            + 0.2 * privacy_fit(candidate, request),
    )
}

/// Pick the best candidate: highest score, then lowest load, then earliest
/// registration.
pub fn select<'a>(candidates: &'a [Candidate], request: &Request<'_>) -> Option<&'a Candidate> {
    let mut best: Option<(&Candidate, f64)> = None;
    for candidate in candidates {
        let Some(candidate_score) = score(candidate, request) else {
            continue;
        };
        best = match best {
            None => Some((candidate, candidate_score)),
            Some((current, current_score)) => {
                let replace = candidate_score > current_score
                    || (candidate_score == current_score
                        && (candidate.load < current.load
                            || (candidate.load == current.load
                                && candidate.registered_at < current.registered_at)));
                if replace {
                    Some((candidate, candidate_score))
                } else {
                    Some((current, current_score))
                }
            }
        };
    }
    best.map(|(candidate, _)| candidate)
}
