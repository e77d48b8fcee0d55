//! Core durable data model: subjects, completions, attempts, verifier
//! profiles, QR tokens, and audit events. Grounded on the shape of
//! `VerificationRecord` / `VerifierProfile` / `UserVerificationLevel` in
//! `original_source/src/nabr/models/verification.py`, translated to a
//! tagged-sum-type style consistent with the teacher's `src/identity.rs`
//! and `src/guardians.rs`.

use crate::method::{Method, SubjectKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type SubjectId = String;
pub type PrincipalId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub subject_id: SubjectId,
    pub kind: SubjectKind,
}

/// A durable record that a subject successfully finished a method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodCompletion {
    pub subject_id: SubjectId,
    pub method: Method,
    pub completed_at: DateTime<Utc>,
    pub count: u32,
    pub points_awarded: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
    pub source_verification_id: Option<String>,
    pub revoked: bool,
}

impl MethodCompletion {
    pub fn new(
        subject_id: SubjectId,
        method: Method,
        count: u32,
        now: DateTime<Utc>,
        metadata: HashMap<String, String>,
        source_verification_id: Option<String>,
    ) -> Self {
        let meta = method.meta();
        let capped_count = count.min(meta.max_multiplier);
        let points_awarded = meta.base_points * capped_count;
        let expires_at = if meta.decay_days > 0 {
            Some(now + chrono::Duration::days(meta.decay_days as i64))
        } else {
            None
        };
        Self {
            subject_id,
            method,
            completed_at: now,
            count: capped_count,
            points_awarded,
            expires_at,
            metadata,
            source_verification_id,
            revoked: false,
        }
    }

    /// Active iff not revoked and (no expiry, or expiry in the future).
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.revoked {
            return false;
        }
        match self.expires_at {
            Some(exp) => exp > now,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    AwaitingParties,
    Validating,
    Completed,
    Rejected,
    Expired,
    Revoked,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Completed
                | AttemptState::Rejected
                | AttemptState::Expired
                | AttemptState::Revoked
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub attempt_id: String,
    pub subject_id: SubjectId,
    pub method: Method,
    pub state: AttemptState,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub saga_step: u32,
    pub data: serde_json::Value,
}

impl VerificationAttempt {
    pub fn new(subject_id: SubjectId, method: Method, deadline: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            attempt_id: Uuid::new_v4().to_string(),
            subject_id,
            method,
            state: AttemptState::Pending,
            created_at: now,
            deadline,
            saga_step: 0,
            data: serde_json::Value::Null,
        }
    }
}

/// A principal authorized (or not) to act as a verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierProfile {
    pub principal_id: PrincipalId,
    pub authorized: bool,
    pub auto_qualified: bool,
    pub credentials: Vec<String>,
    pub attested_count: u32,
    pub rejection_count: u32,
    pub rating: f64,
    pub revoked: bool,
    pub revoked_reason: Option<String>,
    pub last_credential_check_at: Option<DateTime<Utc>>,
    /// The verifier's own trust level, needed for rule 2 of §4.4
    /// ("verifier's own current level < Minimal => not authorized").
    pub own_level: crate::scoring::Level,
}

impl VerifierProfile {
    pub fn is_effective(&self) -> bool {
        self.authorized && !self.revoked
    }
}

/// Auto-qualifying credential tags (§4.4 rule 3).
pub const AUTO_QUALIFYING_CREDENTIALS: &[&str] = &["notary", "attorney", "government_official"];

/// A single-use secret bound to one verifier slot of one two-party attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrToken {
    pub token: String,
    pub attempt_id: String,
    pub slot: u8,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_by: Option<PrincipalId>,
    pub invalidated: bool,
}

impl QrToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.consumed_by.is_none() && !self.invalidated && self.expires_at > now
    }

    /// `scheme://host/verify/{attempt_id}/{token}` per §6. `token` is
    /// already URL-safe base64 with no padding.
    pub fn verification_uri(&self, base_url: &str) -> String {
        format!("{}/verify/{}/{}", base_url.trim_end_matches('/'), self.attempt_id, self.token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    OrchestratorStarted,
    AttemptStarted,
    AttemptStateChanged,
    QrIssued,
    QrConsumed,
    QrInvalidated,
    ConfirmationRecorded,
    ConfirmationRevoked,
    CompletionUpserted,
    CompletionRetracted,
    PointsAwarded,
    LevelChanged,
    Expired,
    Revoked,
    CompensationRan,
    OrchestratorTerminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub subject_id: SubjectId,
    pub kind: AuditEventKind,
    pub actor_id: Option<PrincipalId>,
    pub method: Option<Method>,
    pub attempt_id: Option<String>,
    pub data: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub orchestrator_instance_id: String,
}

impl AuditEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subject_id: SubjectId,
        kind: AuditEventKind,
        actor_id: Option<PrincipalId>,
        method: Option<Method>,
        attempt_id: Option<String>,
        data: serde_json::Value,
        now: DateTime<Utc>,
        orchestrator_instance_id: String,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            subject_id,
            kind,
            actor_id,
            method,
            attempt_id,
            data,
            occurred_at: now,
            orchestrator_instance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario D: a completion whose `decay_days` has elapsed is no
    /// longer active, exactly as if it had been revoked (§8 property 10).
    #[test]
    fn completion_past_decay_window_is_inactive() {
        let completed_at = Utc::now() - chrono::Duration::days(366);
        let completion = MethodCompletion::new(
            "s1".to_string(),
            Method::Email,
            1,
            completed_at,
            HashMap::new(),
            None,
        );
        assert!(!completion.is_active(Utc::now()), "email decays after 365 days");
    }

    #[test]
    fn completion_within_decay_window_is_active() {
        let completed_at = Utc::now() - chrono::Duration::days(10);
        let completion = MethodCompletion::new(
            "s1".to_string(),
            Method::Email,
            1,
            completed_at,
            HashMap::new(),
            None,
        );
        assert!(completion.is_active(Utc::now()));
    }

    #[test]
    fn non_decaying_method_never_expires() {
        let completed_at = Utc::now() - chrono::Duration::days(10_000);
        let completion = MethodCompletion::new(
            "s1".to_string(),
            Method::PersonalReference,
            1,
            completed_at,
            HashMap::new(),
            None,
        );
        assert!(completion.is_active(Utc::now()));
    }

    #[test]
    fn revoked_completion_is_inactive_regardless_of_expiry() {
        let mut completion = MethodCompletion::new(
            "s1".to_string(),
            Method::PersonalReference,
            1,
            Utc::now(),
            HashMap::new(),
            None,
        );
        completion.revoked = true;
        assert!(!completion.is_active(Utc::now()));
    }
}
