//! `TrustState`: the orchestrator's in-memory projection (§3), and the
//! snapshot carried across continue-as-new (§9: "the snapshot is part of
//! the design contract ... MUST encode everything needed to reconstruct
//! `TrustState` and every non-terminal `VerificationAttempt`").

use crate::method::{Method, SubjectKind};
use crate::model::{MethodCompletion, VerificationAttempt};
use crate::scoring::{self, Level};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustState {
    pub subject_id: String,
    pub kind: SubjectKind,
    pub trust_score: u32,
    pub level: Level,
    pub completions: HashMap<Method, MethodCompletion>,
    pub active_attempts: HashMap<String, VerificationAttempt>,
    pub last_expiry_sweep_at: Option<DateTime<Utc>>,
    pub iteration_counter: u64,
}

impl TrustState {
    pub fn new(subject_id: String, kind: SubjectKind) -> Self {
        Self {
            subject_id,
            kind,
            trust_score: 0,
            level: Level::Unverified,
            completions: HashMap::new(),
            active_attempts: HashMap::new(),
            last_expiry_sweep_at: None,
            iteration_counter: 0,
        }
    }

    /// Recompute `trust_score` and `level` from the active completion
    /// set. The only code path allowed to mutate these two fields — §3's
    /// invariant that they must be recomputed atomically and never set
    /// directly.
    pub fn recompute(&mut self, now: DateTime<Utc>) -> Option<Level> {
        let counts: HashMap<Method, u32> = self
            .completions
            .values()
            .filter(|c| c.is_active(now))
            .map(|c| (c.method, c.count))
            .collect();

        let new_score = scoring::score(self.kind, &counts);
        let new_level = scoring::level_for_score(new_score);

        self.trust_score = new_score;
        let previous = self.level;
        self.level = new_level;

        if previous != new_level {
            Some(new_level)
        } else {
            None
        }
    }

    pub fn next_level_info(&self) -> scoring::NextLevelInfo {
        let counts: HashMap<Method, u32> = self
            .completions
            .values()
            .filter(|c| c.is_active(Utc::now()))
            .map(|c| (c.method, c.count))
            .collect();
        scoring::next_level_info(self.kind, &counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recompute_reports_level_change_only_when_it_happens() {
        let mut state = TrustState::new("s1".to_string(), SubjectKind::Individual);
        let now = Utc::now();
        assert_eq!(state.recompute(now), None);

        state.completions.insert(
            Method::InPersonTwoParty,
            MethodCompletion::new(
                "s1".to_string(),
                Method::InPersonTwoParty,
                1,
                now,
                HashMap::new(),
                None,
            ),
        );
        assert_eq!(state.recompute(now), Some(Level::Minimal));
        assert_eq!(state.trust_score, 150);
        // recomputing again with no changes reports no further transition
        assert_eq!(state.recompute(now), None);
    }
}
