//! Saga compensation discipline (§4.5). Not a component in the
//! object-oriented sense — a set of ordered inverse operations driven by
//! `VerificationAttempt::saga_step`, run downward on failure. Grounded on
//! the rollback-activity chain in
//! `original_source/src/nabr/temporal/activities/verification/saga_compensation.py`
//! and on the explicit state-record-over-exceptions pattern the REDESIGN
//! FLAGS call for (no catching across coroutines).

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::method::Method;
use crate::model::{AuditEvent, AuditEventKind};
use crate::store::VerificationStore;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, instrument};

/// Durable steps of the two-party saga, numbered to match
/// `VerificationAttempt::saga_step`. Every step past 0 has an inverse
/// below; inverses run in descending order from the step reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum SagaStep {
    TokensIssued = 1,
    ConfirmationsRecorded = 2,
    CompletionUpserted = 3,
}

/// Run the inverse of every step from `reached` down to 1, each inverse
/// itself idempotent so a retried compensation run is a no-op past the
/// first. Emits one `compensation_ran` audit event per inverse applied.
#[instrument(skip(store), fields(attempt_id = %attempt_id, reached = reached))]
pub async fn compensate(
    store: &Arc<dyn VerificationStore>,
    attempt_id: &str,
    subject_id: &str,
    method: Method,
    reached: u32,
    now: DateTime<Utc>,
    orchestrator_instance_id: &str,
) -> OrchestratorResult<()> {
    if reached >= SagaStep::CompletionUpserted as u32 {
        store
            .retract_completion(subject_id, method)
            .await
            .map_err(|e| OrchestratorError::TransientStorage(e.to_string()))?;
        audit(
            store,
            subject_id,
            attempt_id,
            method,
            "retract_completion",
            now,
            orchestrator_instance_id,
        )
        .await?;
    }

    if reached >= SagaStep::ConfirmationsRecorded as u32 {
        store
            .revoke_confirmations(attempt_id)
            .await
            .map_err(|e| OrchestratorError::TransientStorage(e.to_string()))?;
        audit(
            store,
            subject_id,
            attempt_id,
            method,
            "revoke_confirmations",
            now,
            orchestrator_instance_id,
        )
        .await?;
    }

    if reached >= SagaStep::TokensIssued as u32 {
        store
            .invalidate_qr_tokens(attempt_id)
            .await
            .map_err(|e| OrchestratorError::TransientStorage(e.to_string()))?;
        audit(
            store,
            subject_id,
            attempt_id,
            method,
            "invalidate_qr_tokens",
            now,
            orchestrator_instance_id,
        )
        .await?;
    }

    if reached == 0 {
        error!("compensate called with saga_step=0, nothing to undo");
    }

    Ok(())
}

async fn audit(
    store: &Arc<dyn VerificationStore>,
    subject_id: &str,
    attempt_id: &str,
    method: Method,
    inverse: &str,
    now: DateTime<Utc>,
    orchestrator_instance_id: &str,
) -> OrchestratorResult<()> {
    let event = AuditEvent::new(
        subject_id.to_string(),
        AuditEventKind::CompensationRan,
        None,
        Some(method),
        Some(attempt_id.to_string()),
        json!({ "inverse": inverse }),
        now,
        orchestrator_instance_id.to_string(),
    );
    store
        .record_event(event)
        .await
        .map_err(|e| OrchestratorError::TransientStorage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QrToken;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn compensating_from_tokens_issued_invalidates_tokens_only() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let token = QrToken {
            token: "t1".to_string(),
            attempt_id: "a1".to_string(),
            slot: 0,
            issued_at: now,
            expires_at: now + chrono::Duration::hours(1),
            consumed_by: None,
            invalidated: false,
        };
        store.issue_qr_tokens(vec![token]).await.unwrap();

        compensate(&store, "a1", "s1", Method::InPersonTwoParty, SagaStep::TokensIssued as u32, now, "orch-1")
            .await
            .unwrap();

        let tokens = store.get_qr_tokens("a1").await.unwrap();
        assert!(tokens[0].invalidated);
    }

    #[tokio::test]
    async fn compensating_from_confirmations_recorded_also_revokes() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store.record_confirmation("a1", 0, "v1", now).await.unwrap();

        compensate(
            &store,
            "a1",
            "s1",
            Method::InPersonTwoParty,
            SagaStep::ConfirmationsRecorded as u32,
            now,
            "orch-1",
        )
        .await
        .unwrap();

        let confirmations = store.get_confirmations("a1").await.unwrap();
        assert!(confirmations.is_empty());
    }
}
