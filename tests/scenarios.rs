//! End-to-end scenarios from spec §8, driven entirely through signals
//! and queries against a real `Orchestrator` instance backed by
//! `store::memory`, the way an external caller would.

use nabr_trust_orchestrator::config::Config;
use nabr_trust_orchestrator::method::{Method, SubjectKind};
use nabr_trust_orchestrator::model::{AuditEventKind, VerifierProfile};
use nabr_trust_orchestrator::notifier::LoggingNotifier;
use nabr_trust_orchestrator::orchestrator::signals::{Query, QueryResponse, Signal};
use nabr_trust_orchestrator::orchestrator::{self, OrchestratorHandle};
use nabr_trust_orchestrator::scoring::Level;
use nabr_trust_orchestrator::store::memory::MemoryStore;
use nabr_trust_orchestrator::store::VerificationStore;
use nabr_trust_orchestrator::verifier_auth::VerifierAuthorizer;
use std::sync::Arc;
use std::time::Duration;

fn verifier(id: &str, auto_qualified: bool, rating: f64, attested_count: u32, credentials: Vec<&str>) -> VerifierProfile {
    VerifierProfile {
        principal_id: id.to_string(),
        authorized: true,
        auto_qualified,
        credentials: credentials.into_iter().map(|s| s.to_string()).collect(),
        attested_count,
        rejection_count: 0,
        rating,
        revoked: false,
        revoked_reason: None,
        last_credential_check_at: Some(chrono::Utc::now()),
        own_level: Level::Minimal,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn spawn_test_orchestrator(store: Arc<dyn VerificationStore>) -> OrchestratorHandle {
    let authorizer = Arc::new(VerifierAuthorizer::new(store.clone()));
    let notifier = Arc::new(LoggingNotifier);
    let config = Arc::new(Config::for_tests());
    orchestrator::spawn(
        "subject-1".to_string(),
        SubjectKind::Individual,
        store,
        authorizer,
        notifier,
        config,
    )
}

async fn score_and_level(handle: &OrchestratorHandle) -> (u32, Level) {
    let score = match handle.query(Query::TrustScore).await {
        QueryResponse::TrustScore(s) => s,
        other => panic!("unexpected response: {other:?}"),
    };
    let level = match handle.query(Query::Level).await {
        QueryResponse::Level(l) => l,
        other => panic!("unexpected response: {other:?}"),
    };
    (score, level)
}

async fn active_two_party_attempt_id(handle: &OrchestratorHandle) -> String {
    match handle.query(Query::ActiveAttempts).await {
        QueryResponse::ActiveAttempts(attempts) => attempts
            .into_iter()
            .find(|a| a.method == Method::InPersonTwoParty)
            .map(|a| a.attempt_id)
            .expect("no active two-party attempt"),
        other => panic!("unexpected response: {other:?}"),
    }
}

/// Scenario A — undocumented individual reaches Minimal via two verifiers.
#[tokio::test]
async fn scenario_a_two_party_reaches_minimal() {
    let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
    store
        .upsert_verifier_profile(verifier("v1", false, 0.0, 0, vec!["notary"]))
        .await
        .unwrap();
    store
        .upsert_verifier_profile(verifier("v2", false, 4.5, 0, vec!["community_leader"]))
        .await
        .unwrap();

    let handle = spawn_test_orchestrator(store.clone());

    handle
        .send_signal(Signal::StartMethod { method: Method::InPersonTwoParty, params: serde_json::json!({}) })
        .await;
    settle().await;

    let attempt_id = active_two_party_attempt_id(&handle).await;
    let tokens = store.get_qr_tokens(&attempt_id).await.unwrap();
    assert_eq!(tokens.len(), 2);

    handle
        .send_signal(Signal::VerifierConfirmation {
            token: tokens[0].token.clone(),
            verifier_id: "v1".to_string(),
            location: None,
            device_fp: None,
        })
        .await;
    settle().await;

    handle
        .send_signal(Signal::VerifierConfirmation {
            token: tokens[1].token.clone(),
            verifier_id: "v2".to_string(),
            location: None,
            device_fp: None,
        })
        .await;
    settle().await;

    let (score, level) = score_and_level(&handle).await;
    assert_eq!(score, 150);
    assert_eq!(level, Level::Minimal);

    let events = store.list_events("subject-1").await.unwrap();
    let count = |kind: AuditEventKind| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(AuditEventKind::QrIssued), 2);
    assert_eq!(count(AuditEventKind::QrConsumed), 2);
    assert_eq!(count(AuditEventKind::ConfirmationRecorded), 2);
}

/// Scenario C — saga compensation when the second verifier is unauthorized.
#[tokio::test]
async fn scenario_c_unauthorized_second_verifier_compensates() {
    let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
    store
        .upsert_verifier_profile(verifier("v1", true, 0.0, 0, vec![]))
        .await
        .unwrap();
    let mut unauth = verifier("v_unauth", false, 0.0, 0, vec![]);
    unauth.authorized = false;
    store.upsert_verifier_profile(unauth).await.unwrap();

    let handle = spawn_test_orchestrator(store.clone());

    handle
        .send_signal(Signal::StartMethod { method: Method::InPersonTwoParty, params: serde_json::json!({}) })
        .await;
    settle().await;

    let attempt_id = active_two_party_attempt_id(&handle).await;
    let tokens = store.get_qr_tokens(&attempt_id).await.unwrap();

    handle
        .send_signal(Signal::VerifierConfirmation {
            token: tokens[0].token.clone(),
            verifier_id: "v1".to_string(),
            location: None,
            device_fp: None,
        })
        .await;
    settle().await;

    handle
        .send_signal(Signal::VerifierConfirmation {
            token: tokens[1].token.clone(),
            verifier_id: "v_unauth".to_string(),
            location: None,
            device_fp: None,
        })
        .await;
    settle().await;

    let (score, level) = score_and_level(&handle).await;
    assert_eq!(score, 0);
    assert_eq!(level, Level::Unverified);

    let remaining_tokens = store.get_qr_tokens(&attempt_id).await.unwrap();
    assert!(remaining_tokens.iter().all(|t| t.invalidated));
}

/// Scenario E — three distinct personal-reference attestations reach
/// Minimal with no documents at all.
#[tokio::test]
async fn scenario_e_personal_references_reach_minimal() {
    let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
    let handle = spawn_test_orchestrator(store.clone());

    for attestor in ["a1", "a2", "a3"] {
        handle
            .send_signal(Signal::CommunityAttestation {
                attestor_id: attestor.to_string(),
                method: Method::PersonalReference,
                attestation_data: serde_json::json!({}),
            })
            .await;
        settle().await;
    }

    let (score, level) = score_and_level(&handle).await;
    assert_eq!(score, 150);
    assert_eq!(level, Level::Minimal);

    // a fourth attestation adds nothing further
    handle
        .send_signal(Signal::CommunityAttestation {
            attestor_id: "a4".to_string(),
            method: Method::PersonalReference,
            attestation_data: serde_json::json!({}),
        })
        .await;
    settle().await;
    let (score_after, _) = score_and_level(&handle).await;
    assert_eq!(score_after, 150);
}

/// A clean revoke brings the score and level back down and is audited.
#[tokio::test]
async fn revoke_method_lowers_score_and_level() {
    let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
    let handle = spawn_test_orchestrator(store.clone());

    handle
        .send_signal(Signal::CommunityAttestation {
            attestor_id: "a1".to_string(),
            method: Method::PersonalReference,
            attestation_data: serde_json::json!({}),
        })
        .await;
    settle().await;

    handle
        .send_signal(Signal::RevokeMethod { method: Method::PersonalReference, reason: "fraud".to_string() })
        .await;
    settle().await;

    let (score, level) = score_and_level(&handle).await;
    assert_eq!(score, 0);
    assert_eq!(level, Level::Unverified);
}

/// Passive history milestones award points without any child workflow.
#[tokio::test]
async fn history_milestone_awards_points_passively() {
    let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
    let handle = spawn_test_orchestrator(store.clone());

    handle
        .send_signal(Signal::HistoryMilestone { method: Method::PlatformHistory, value: 1 })
        .await;
    settle().await;

    let (score, _) = score_and_level(&handle).await;
    assert_eq!(score, 30);
}

/// Scenario B — a third actor racing to consume an already-consumed slot
/// is rejected, leaving the attempt still awaiting its second signal.
#[tokio::test]
async fn scenario_b_token_collision_is_rejected() {
    let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
    store
        .upsert_verifier_profile(verifier("v1", true, 0.0, 0, vec![]))
        .await
        .unwrap();
    store
        .upsert_verifier_profile(verifier("v3", true, 0.0, 0, vec![]))
        .await
        .unwrap();

    let handle = spawn_test_orchestrator(store.clone());

    handle
        .send_signal(Signal::StartMethod { method: Method::InPersonTwoParty, params: serde_json::json!({}) })
        .await;
    settle().await;

    let attempt_id = active_two_party_attempt_id(&handle).await;
    let tokens = store.get_qr_tokens(&attempt_id).await.unwrap();

    handle
        .send_signal(Signal::VerifierConfirmation {
            token: tokens[0].token.clone(),
            verifier_id: "v1".to_string(),
            location: None,
            device_fp: None,
        })
        .await;
    settle().await;

    // v3 tries to consume the same (already-consumed) token.
    handle
        .send_signal(Signal::VerifierConfirmation {
            token: tokens[0].token.clone(),
            verifier_id: "v3".to_string(),
            location: None,
            device_fp: None,
        })
        .await;
    settle().await;

    // No state change: attempt still awaits slot 2, nothing awarded yet.
    let (score, level) = score_and_level(&handle).await;
    assert_eq!(score, 0);
    assert_eq!(level, Level::Unverified);
    let still_active = active_two_party_attempt_id(&handle).await;
    assert_eq!(still_active, attempt_id);

    let consume_again = store.consume_qr_token(&tokens[0].token, "v3", chrono::Utc::now()).await.unwrap();
    assert_eq!(consume_again, nabr_trust_orchestrator::store::ConsumeOutcome::AlreadyConsumedByOther);

    let events = store.list_events("subject-1").await.unwrap();
    let qr_consumed_events: Vec<_> = events.iter().filter(|e| e.kind == AuditEventKind::QrConsumed).collect();
    assert_eq!(qr_consumed_events.len(), 2, "one per consumption attempt, successful or not");
    assert!(qr_consumed_events
        .iter()
        .any(|e| e.data.get("outcome").and_then(|v| v.as_str()) == Some("AlreadyConsumedByOther")));
}

/// Continue-as-new: after the iteration cap is reached, queries still
/// reflect pre-restart state (§9, scenario F).
#[tokio::test]
async fn continue_as_new_preserves_trust_state() {
    let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
    let authorizer = Arc::new(VerifierAuthorizer::new(store.clone()));
    let notifier = Arc::new(LoggingNotifier);
    let mut config = Config::for_tests();
    config.continue_as_new_iteration_cap = 2;
    let handle = orchestrator::spawn(
        "subject-1".to_string(),
        SubjectKind::Individual,
        store.clone(),
        authorizer,
        notifier,
        Arc::new(config),
    );

    handle
        .send_signal(Signal::CommunityAttestation {
            attestor_id: "a1".to_string(),
            method: Method::PersonalReference,
            attestation_data: serde_json::json!({}),
        })
        .await;
    settle().await;

    // Drive enough iterations (signal + query round trips) to cross the
    // tiny iteration cap and force at least one continue-as-new.
    for _ in 0..5 {
        let _ = handle.query(Query::TrustScore).await;
        settle().await;
    }

    let (score, level) = score_and_level(&handle).await;
    assert_eq!(score, 50);
    assert_eq!(level, Level::Unverified);

    // The attestation is still tracked; a second distinct attestor still
    // accumulates normally after the restart.
    handle
        .send_signal(Signal::CommunityAttestation {
            attestor_id: "a2".to_string(),
            method: Method::PersonalReference,
            attestation_data: serde_json::json!({}),
        })
        .await;
    settle().await;
    let (score_after, _) = score_and_level(&handle).await;
    assert_eq!(score_after, 100);
}
