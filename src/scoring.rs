//! Pure, deterministic scoring model. No I/O, no clocks, no randomness —
//! safe to call from orchestrator replay code and from plain unit tests.

use crate::method::{Method, SubjectKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Discrete trust levels, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Unverified,
    Minimal,
    Standard,
    Enhanced,
    Complete,
}

impl Level {
    const ORDERED: [Level; 5] = [
        Level::Unverified,
        Level::Minimal,
        Level::Standard,
        Level::Enhanced,
        Level::Complete,
    ];

    /// Minimum score required to hold this level. Uniform across subject
    /// kinds — the source's per-kind `BASELINE_METHODS` shortcuts are
    /// advisory only, not gates (see DESIGN.md Open Questions).
    pub fn threshold(self) -> u32 {
        match self {
            Level::Unverified => 0,
            Level::Minimal => 100,
            Level::Standard => 250,
            Level::Enhanced => 400,
            Level::Complete => 600,
        }
    }

    /// The level immediately above this one, if any.
    pub fn next(self) -> Option<Level> {
        let idx = Level::ORDERED.iter().position(|l| *l == self)?;
        Level::ORDERED.get(idx + 1).copied()
    }
}

/// Points contributed by one active completion: `min(count, max_multiplier) * base_points`.
pub fn points_for(method: Method, count: u32) -> u32 {
    let meta = method.meta();
    meta.base_points * count.min(meta.max_multiplier)
}

/// Total trust score from a bag of `(method, count)`, restricted to
/// methods applicable to `kind`. Pure: reordering the input, or
/// duplicating the same method key, never changes the result (callers
/// are expected to pass a map keyed by method, so duplication can't
/// occur, but we don't rely on that for the result to be well-defined).
pub fn score(kind: SubjectKind, completions: &HashMap<Method, u32>) -> u32 {
    completions
        .iter()
        .filter(|(m, _)| m.applicable_kinds().contains(&kind))
        .map(|(m, count)| points_for(*m, *count))
        .sum()
}

/// The highest level whose threshold the score meets.
pub fn level_for_score(score: u32) -> Level {
    Level::ORDERED
        .iter()
        .rev()
        .find(|l| score >= l.threshold())
        .copied()
        .unwrap_or(Level::Unverified)
}

/// A pre-curated minimal combination of methods that would raise a
/// subject from nothing to the next level, named for display purposes
/// only (e.g. "two trusted community members in person").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedPath {
    pub label: String,
    pub methods: Vec<Method>,
}

/// Result of `next_level_info`: the next level above the current score,
/// how many more points are needed, and suggested paths to get there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextLevelInfo {
    pub next_level: Option<Level>,
    pub points_needed: u32,
    pub progress_percent: f64,
    pub suggested_paths: Vec<SuggestedPath>,
}

fn curated_paths(kind: SubjectKind) -> Vec<SuggestedPath> {
    match kind {
        SubjectKind::Individual => vec![
            SuggestedPath {
                label: "Two trusted community members, in person".to_string(),
                methods: vec![Method::InPersonTwoParty],
            },
            SuggestedPath {
                label: "Three personal references".to_string(),
                methods: vec![Method::PersonalReference],
            },
            SuggestedPath {
                label: "Government ID review".to_string(),
                methods: vec![Method::GovernmentId],
            },
        ],
        SubjectKind::Business => vec![
            SuggestedPath {
                label: "Business license or tax ID".to_string(),
                methods: vec![Method::BusinessLicense],
            },
            SuggestedPath {
                label: "Business address plus owner verification".to_string(),
                methods: vec![Method::BusinessAddress, Method::OwnerVerification],
            },
        ],
        SubjectKind::Organization => vec![
            SuggestedPath {
                label: "Nonprofit status or tax ID".to_string(),
                methods: vec![Method::NonprofitStatus],
            },
            SuggestedPath {
                label: "Board verification plus bylaws".to_string(),
                methods: vec![Method::BoardVerification, Method::OrganizationBylaws],
            },
        ],
    }
}

/// Given the current score, kind, and completed-method set, compute the
/// next level, points needed, and suggested paths not already fully
/// satisfied.
pub fn next_level_info(
    kind: SubjectKind,
    completions: &HashMap<Method, u32>,
) -> NextLevelInfo {
    let current_score = score(kind, completions);
    let current_level = level_for_score(current_score);
    let next_level = current_level.next();

    let points_needed = next_level
        .map(|l| l.threshold().saturating_sub(current_score))
        .unwrap_or(0);

    let progress_percent = match next_level {
        Some(next) => {
            let lo = current_level.threshold() as f64;
            let hi = next.threshold() as f64;
            if hi > lo {
                (((current_score as f64 - lo) / (hi - lo)) * 100.0).clamp(0.0, 100.0)
            } else {
                100.0
            }
        }
        None => 100.0,
    };

    let suggested_paths = curated_paths(kind)
        .into_iter()
        .filter(|path| {
            // Drop paths that are already fully satisfied (every method in
            // the path is already at its multiplier cap).
            !path.methods.iter().all(|m| {
                let have = completions.get(m).copied().unwrap_or(0);
                have >= m.meta().max_multiplier
            })
        })
        .collect();

    NextLevelInfo {
        next_level,
        points_needed,
        progress_percent,
        suggested_paths,
    }
}
