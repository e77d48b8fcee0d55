//! Two-party in-person child workflow (§4.3) — the inclusive core of the
//! whole system, and the one explicit saga. QR tokens are issued by the
//! orchestrator before this task is spawned (step 1); this task owns
//! steps 2–5: awaiting both confirmations, validating both verifiers,
//! persisting confirmations, and returning the completion. Grounded on
//! `original_source/src/nabr/temporal/workflows/verification/methods/two_party_in_person.py`
//! for the step ordering and on `src/guardians.rs` for the
//! two-distinct-principals shape.

use super::{ChildFailure, ChildOutcome, CompletionProposal};
use crate::method::Method;
use crate::model::{AuditEvent, AuditEventKind};
use crate::saga::{self, SagaStep};
use crate::store::{ConsumeOutcome, VerificationStore};
use crate::verifier_auth::VerifierAuthorizer;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Record an audit event from inside the child task. The orchestrator
/// owns the durable audit trail's store handle but not this task's
/// locals, so this mirrors `Orchestrator::audit` rather than routing
/// back through a channel for every consumption attempt.
async fn audit(
    store: &Arc<dyn VerificationStore>,
    subject_id: &str,
    attempt_id: &str,
    kind: AuditEventKind,
    actor_id: Option<String>,
    data: serde_json::Value,
    orchestrator_instance_id: &str,
) {
    let event = AuditEvent::new(
        subject_id.to_string(),
        kind,
        actor_id,
        Some(Method::InPersonTwoParty),
        Some(attempt_id.to_string()),
        data,
        Utc::now(),
        orchestrator_instance_id.to_string(),
    );
    if let Err(e) = store.record_event(event).await {
        warn!(%attempt_id, "failed to record audit event: {e}");
    }
}

#[derive(Debug, Clone)]
pub enum TwoPartySignal {
    VerifierConfirmation { token: String, verifier_id: String },
    Cancel,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    subject_id: String,
    attempt_id: String,
    deadline: Instant,
    store: Arc<dyn VerificationStore>,
    authorizer: Arc<VerifierAuthorizer>,
    orchestrator_instance_id: String,
    mut signals: mpsc::Receiver<TwoPartySignal>,
) -> ChildOutcome {
    let mut slots: [Option<String>; 2] = [None, None];

    loop {
        tokio::select! {
            _ = sleep(deadline.saturating_duration_since(Instant::now())) => {
                warn!(subject = %subject_id, %attempt_id, "two-party deadline elapsed, invalidating tokens");
                let _ = saga::compensate(
                    &store, &attempt_id, &subject_id, Method::InPersonTwoParty,
                    SagaStep::TokensIssued as u32, Utc::now(), &orchestrator_instance_id,
                ).await;
                return ChildOutcome::Failed { method: Method::InPersonTwoParty, reason: ChildFailure::Timeout };
            }
            signal = signals.recv() => {
                match signal {
                    None | Some(TwoPartySignal::Cancel) => {
                        let _ = saga::compensate(
                            &store, &attempt_id, &subject_id, Method::InPersonTwoParty,
                            SagaStep::TokensIssued as u32, Utc::now(), &orchestrator_instance_id,
                        ).await;
                        return ChildOutcome::Failed { method: Method::InPersonTwoParty, reason: ChildFailure::Cancelled };
                    }
                    Some(TwoPartySignal::VerifierConfirmation { token, verifier_id }) => {
                        if let Some(outcome) = handle_confirmation(
                            &subject_id, &attempt_id, &token, &verifier_id,
                            &store, &authorizer, &orchestrator_instance_id, &mut slots,
                        ).await {
                            return outcome;
                        }
                    }
                }
            }
        }
    }
}

/// Process one confirmation signal. Returns `Some(outcome)` only once the
/// child workflow has reached a terminal state; rejected/no-op signals
/// return `None` so the loop keeps waiting.
#[allow(clippy::too_many_arguments)]
async fn handle_confirmation(
    subject_id: &str,
    attempt_id: &str,
    token: &str,
    verifier_id: &str,
    store: &Arc<dyn VerificationStore>,
    authorizer: &Arc<VerifierAuthorizer>,
    orchestrator_instance_id: &str,
    slots: &mut [Option<String>; 2],
) -> Option<ChildOutcome> {
    let now = Utc::now();

    let tokens = match store.get_qr_tokens(attempt_id).await {
        Ok(t) => t,
        Err(e) => {
            warn!(%attempt_id, "failed to load qr tokens: {e}");
            return None;
        }
    };
    let Some(matched) = tokens.iter().find(|t| t.token == token) else {
        warn!(%attempt_id, %verifier_id, "confirmation signal referenced unknown token, rejecting");
        return None;
    };
    let slot = matched.slot as usize;
    if slot >= slots.len() {
        warn!(%attempt_id, slot, "confirmation signal referenced out-of-range slot, rejecting");
        return None;
    }

    if let Some(existing) = &slots[slot] {
        if existing != verifier_id {
            warn!(%attempt_id, slot, "slot already filled by a different verifier, rejecting");
        }
        return None;
    }
    let other_slot = 1 - slot;
    if let Some(other_verifier) = &slots[other_slot] {
        if other_verifier == verifier_id {
            warn!(%attempt_id, %verifier_id, "same verifier attempted to fill both slots, rejecting");
            return None;
        }
    }

    let consume_outcome = match store.consume_qr_token(token, verifier_id, now).await {
        Ok(o) => o,
        Err(e) => {
            warn!(%attempt_id, "qr token consumption failed transiently: {e}");
            return None;
        }
    };

    audit(
        store,
        subject_id,
        attempt_id,
        AuditEventKind::QrConsumed,
        Some(verifier_id.to_string()),
        json!({ "slot": slot, "outcome": format!("{consume_outcome:?}") }),
        orchestrator_instance_id,
    )
    .await;

    match consume_outcome {
        ConsumeOutcome::AlreadyConsumedBySame => None,
        ConsumeOutcome::AlreadyConsumedByOther | ConsumeOutcome::Invalid | ConsumeOutcome::Expired => {
            info!(%attempt_id, ?consume_outcome, "qr consumption conflict");
            None
        }
        ConsumeOutcome::Ok => {
            slots[slot] = Some(verifier_id.to_string());
            if let Err(e) = store.record_confirmation(attempt_id, slot as u8, verifier_id, now).await {
                warn!(%attempt_id, "failed to persist confirmation: {e}");
                return None;
            }
            audit(
                store,
                subject_id,
                attempt_id,
                AuditEventKind::ConfirmationRecorded,
                Some(verifier_id.to_string()),
                json!({ "slot": slot }),
                orchestrator_instance_id,
            )
            .await;

            let (Some(verifier_a), Some(verifier_b)) = (slots[0].clone(), slots[1].clone()) else {
                return None;
            };

            if let Err(_e) = VerifierAuthorizer::check_two_party_distinctness(subject_id, &verifier_a, &verifier_b) {
                let _ = saga::compensate(
                    store, attempt_id, subject_id, Method::InPersonTwoParty,
                    SagaStep::ConfirmationsRecorded as u32, now, orchestrator_instance_id,
                ).await;
                return Some(ChildOutcome::Failed {
                    method: Method::InPersonTwoParty,
                    reason: ChildFailure::VerifierUnauthorized,
                });
            }

            let auth_a = authorizer.authorize(subject_id, &verifier_a, now).await;
            let auth_b = authorizer.authorize(subject_id, &verifier_b, now).await;
            if auth_a.is_err() || auth_b.is_err() {
                warn!(%attempt_id, "one or both two-party verifiers unauthorized, compensating");
                let _ = saga::compensate(
                    store, attempt_id, subject_id, Method::InPersonTwoParty,
                    SagaStep::ConfirmationsRecorded as u32, now, orchestrator_instance_id,
                ).await;
                return Some(ChildOutcome::Failed {
                    method: Method::InPersonTwoParty,
                    reason: ChildFailure::VerifierUnauthorized,
                });
            }

            info!(%attempt_id, "both verifiers confirmed and authorized");
            Some(ChildOutcome::Completed(
                CompletionProposal::new(Method::InPersonTwoParty, 1)
                    .with_metadata("verifier_a", verifier_a)
                    .with_metadata("verifier_b", verifier_b),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QrToken, VerifierProfile};
    use crate::scoring::Level;
    use crate::store::memory::MemoryStore;

    fn verifier(id: &str, auto_qualified: bool) -> VerifierProfile {
        VerifierProfile {
            principal_id: id.to_string(),
            authorized: true,
            auto_qualified,
            credentials: vec![],
            attested_count: 0,
            rejection_count: 0,
            rating: 0.0,
            revoked: false,
            revoked_reason: None,
            last_credential_check_at: Some(Utc::now()),
            own_level: Level::Minimal,
        }
    }

    async fn setup_tokens(store: &Arc<dyn VerificationStore>, attempt_id: &str) -> (String, String) {
        let now = Utc::now();
        let tokens = crate::qr::issue_pair(attempt_id, now, crate::qr::QR_TOKEN_TTL);
        let (t0, t1) = (tokens[0].token.clone(), tokens[1].token.clone());
        store.issue_qr_tokens(tokens.to_vec()).await.unwrap();
        (t0, t1)
    }

    #[tokio::test]
    async fn both_slots_filled_by_authorized_verifiers_completes() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        store.upsert_verifier_profile(verifier("v1", true)).await.unwrap();
        store.upsert_verifier_profile(verifier("v2", true)).await.unwrap();
        let authorizer = Arc::new(VerifierAuthorizer::new(store.clone()));

        let (tx, rx) = mpsc::channel(8);
        let (t0, t1) = setup_tokens(&store, "a1").await;

        let handle = tokio::spawn(run(
            "s1".to_string(),
            "a1".to_string(),
            Instant::now() + std::time::Duration::from_secs(60),
            store.clone(),
            authorizer,
            "orch-1".to_string(),
            rx,
        ));

        tx.send(TwoPartySignal::VerifierConfirmation { token: t0, verifier_id: "v1".to_string() })
            .await
            .unwrap();
        tx.send(TwoPartySignal::VerifierConfirmation { token: t1, verifier_id: "v2".to_string() })
            .await
            .unwrap();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, ChildOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn same_verifier_cannot_fill_both_slots() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        store.upsert_verifier_profile(verifier("v1", true)).await.unwrap();
        let authorizer = Arc::new(VerifierAuthorizer::new(store.clone()));

        let (tx, rx) = mpsc::channel(8);
        let (t0, t1) = setup_tokens(&store, "a1").await;

        let handle = tokio::spawn(run(
            "s1".to_string(),
            "a1".to_string(),
            Instant::now() + std::time::Duration::from_millis(300),
            store.clone(),
            authorizer,
            "orch-1".to_string(),
            rx,
        ));

        tx.send(TwoPartySignal::VerifierConfirmation { token: t0, verifier_id: "v1".to_string() })
            .await
            .unwrap();
        tx.send(TwoPartySignal::VerifierConfirmation { token: t1, verifier_id: "v1".to_string() })
            .await
            .unwrap();
        drop(tx);

        let outcome = handle.await.unwrap();
        assert!(matches!(
            outcome,
            ChildOutcome::Failed { reason: ChildFailure::Timeout, .. }
        ));
    }

    #[tokio::test]
    async fn unauthorized_second_verifier_triggers_compensation() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        store.upsert_verifier_profile(verifier("v1", true)).await.unwrap();
        store.upsert_verifier_profile(verifier("v_unauth", false)).await.unwrap();
        let authorizer = Arc::new(VerifierAuthorizer::new(store.clone()));

        let (tx, rx) = mpsc::channel(8);
        let (t0, t1) = setup_tokens(&store, "a1").await;

        let handle = tokio::spawn(run(
            "s1".to_string(),
            "a1".to_string(),
            Instant::now() + std::time::Duration::from_secs(60),
            store.clone(),
            authorizer,
            "orch-1".to_string(),
            rx,
        ));

        tx.send(TwoPartySignal::VerifierConfirmation { token: t0, verifier_id: "v1".to_string() })
            .await
            .unwrap();
        tx.send(TwoPartySignal::VerifierConfirmation { token: t1, verifier_id: "v_unauth".to_string() })
            .await
            .unwrap();

        let outcome = handle.await.unwrap();
        assert!(matches!(
            outcome,
            ChildOutcome::Failed { reason: ChildFailure::VerifierUnauthorized, .. }
        ));

        let confirmations = store.get_confirmations("a1").await.unwrap();
        assert!(confirmations.is_empty(), "compensation must revoke recorded confirmations");
        let tokens = store.get_qr_tokens("a1").await.unwrap();
        assert!(tokens.iter().all(|t| t.invalidated), "compensation must invalidate both tokens");
    }
}
