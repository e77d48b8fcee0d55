//! Durable storage for verifier profiles, method completions, attempts,
//! QR tokens, and audit events (spec §4.2). The trait is the seam: a
//! Postgres-backed implementation (`postgres`) is the production adapter,
//! an in-memory implementation (`memory`) backs unit and scenario tests.

pub mod memory;
pub mod postgres;

use crate::method::Method;
use crate::model::{AuditEvent, MethodCompletion, QrToken, SubjectId, VerificationAttempt, VerifierProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a QR token consumption attempt (§4.2, §8 property 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Ok,
    AlreadyConsumedBySame,
    AlreadyConsumedByOther,
    Invalid,
    Expired,
}

/// The verification store contract. Every write is idempotent so that
/// retries driven by `backoff` are safe; the only operation that mutates
/// a QR token is `consume_qr_token`, which must be atomic (compare-and-set
/// semantics) since it is the one cross-subject race in the system.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn upsert_completion(&self, completion: MethodCompletion) -> StoreResult<()>;

    async fn retract_completion(&self, subject_id: &str, method: Method) -> StoreResult<()>;

    async fn get_completions(&self, subject_id: &str) -> StoreResult<Vec<MethodCompletion>>;

    async fn list_expiring_completions(&self, now: DateTime<Utc>) -> StoreResult<Vec<MethodCompletion>>;

    async fn upsert_attempt(&self, attempt: VerificationAttempt) -> StoreResult<()>;

    async fn get_attempt(&self, attempt_id: &str) -> StoreResult<Option<VerificationAttempt>>;

    async fn active_attempt_for_method(
        &self,
        subject_id: &str,
        method: Method,
    ) -> StoreResult<Option<VerificationAttempt>>;

    async fn issue_qr_tokens(&self, tokens: Vec<QrToken>) -> StoreResult<()>;

    async fn consume_qr_token(&self, token: &str, verifier: &str, now: DateTime<Utc>) -> StoreResult<ConsumeOutcome>;

    async fn invalidate_qr_tokens(&self, attempt_id: &str) -> StoreResult<()>;

    async fn get_qr_tokens(&self, attempt_id: &str) -> StoreResult<Vec<QrToken>>;

    /// Record or overwrite a verifier confirmation for `(attempt_id, slot,
    /// verifier_id)`. Idempotent on that key per §4.3 step 4.
    async fn record_confirmation(
        &self,
        attempt_id: &str,
        slot: u8,
        verifier_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn revoke_confirmations(&self, attempt_id: &str) -> StoreResult<()>;

    async fn get_confirmations(&self, attempt_id: &str) -> StoreResult<Vec<(u8, String)>>;

    async fn get_verifier_profile(&self, principal_id: &str) -> StoreResult<Option<VerifierProfile>>;

    async fn upsert_verifier_profile(&self, profile: VerifierProfile) -> StoreResult<()>;

    async fn record_event(&self, event: AuditEvent) -> StoreResult<()>;

    async fn list_events(&self, subject_id: &str) -> StoreResult<Vec<AuditEvent>>;

    /// Accumulate a distinct attestor toward a community-attestation-style
    /// method. Returns the updated distinct-attestor count. Idempotent on
    /// `(attestor_id, method)`.
    async fn record_attestation(
        &self,
        subject_id: &str,
        method: Method,
        attestor_id: &str,
    ) -> StoreResult<u32>;

    fn as_subject_id(&self, s: &str) -> SubjectId {
        s.to_string()
    }
}
