//! The subject orchestrator (§4.6): one long-lived `tokio` task per
//! subject, the single writer of that subject's `TrustState`. Driven
//! entirely by signals, child-workflow outcomes, and timers — never by
//! synchronous calls, matching §5's suspension-point discipline.
//! Structured as an actor behind an `mpsc` inbox, the same shape as
//! `src/services/federation_sync.rs`'s background sync loop.

pub mod signals;
pub mod snapshot;

use crate::config::Config;
use crate::error::OrchestratorError;
use crate::method::{Method, SubjectKind};
use crate::methods::{community_attestation, email_phone, government_id, two_party, ChildFailure, ChildOutcome};
use crate::model::{AttemptState, AuditEvent, AuditEventKind, MethodCompletion, VerificationAttempt};
use crate::notifier::{Notification, NotificationKind, Notifier};
use crate::qr;
use crate::saga;
use crate::scoring::Level;
use crate::store::VerificationStore;
use crate::verifier_auth::VerifierAuthorizer;
use chrono::Utc;
use serde_json::{json, Value};
use signals::{CompositeView, Query, QueryResponse, Signal};
use snapshot::TrustState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Messages an `OrchestratorHandle` can deliver to the running actor.
enum OrchestratorMessage {
    Signal(Signal),
    Query(Query, oneshot::Sender<QueryResponse>),
}

/// Handle to a running orchestrator instance. Cloneable, cheap — routes
/// through the instance's inbox channel.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorMessage>,
}

impl OrchestratorHandle {
    /// Fire-and-forget a signal. Delivery is at-least-once and ordered
    /// per §5; if the orchestrator has already stopped, the signal is
    /// silently dropped (mirrors delivering to a terminated instance).
    pub async fn send_signal(&self, signal: Signal) {
        let _ = self.tx.send(OrchestratorMessage::Signal(signal)).await;
    }

    pub async fn query(&self, query: Query) -> QueryResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(OrchestratorMessage::Query(query, reply_tx)).await.is_err() {
            return QueryResponse::Unavailable;
        }
        reply_rx.await.unwrap_or(QueryResponse::Unavailable)
    }
}

/// A live child attempt: its method (for routing) and the typed sender
/// into its task's signal channel.
enum ChildSender {
    EmailPhone(mpsc::Sender<email_phone::EmailPhoneSignal>),
    GovernmentId(mpsc::Sender<government_id::GovernmentIdSignal>),
    TwoParty(mpsc::Sender<two_party::TwoPartySignal>),
}

struct ChildResult {
    attempt_id: String,
    outcome: ChildOutcome,
}

pub struct Orchestrator {
    state: TrustState,
    store: Arc<dyn VerificationStore>,
    authorizer: Arc<VerifierAuthorizer>,
    notifier: Arc<dyn Notifier>,
    config: Arc<Config>,
    instance_id: String,
    children: HashMap<String, ChildSender>,
    inbox: mpsc::Receiver<OrchestratorMessage>,
    child_results_tx: mpsc::Sender<ChildResult>,
    child_results_rx: mpsc::Receiver<ChildResult>,
    terminated: bool,
}

/// Spawn a fresh orchestrator instance for a brand-new subject.
pub fn spawn(
    subject_id: String,
    kind: SubjectKind,
    store: Arc<dyn VerificationStore>,
    authorizer: Arc<VerifierAuthorizer>,
    notifier: Arc<dyn Notifier>,
    config: Arc<Config>,
) -> OrchestratorHandle {
    spawn_from_state(TrustState::new(subject_id, kind), store, authorizer, notifier, config)
}

/// Spawn an orchestrator instance hydrated from a continue-as-new
/// snapshot (§9). All active attempts resume awaiting signals with the
/// deadlines recorded in the snapshot.
pub fn spawn_from_state(
    state: TrustState,
    store: Arc<dyn VerificationStore>,
    authorizer: Arc<VerifierAuthorizer>,
    notifier: Arc<dyn Notifier>,
    config: Arc<Config>,
) -> OrchestratorHandle {
    let (tx, inbox) = mpsc::channel(256);
    let (child_results_tx, child_results_rx) = mpsc::channel(64);

    let orchestrator = Orchestrator {
        state,
        store,
        authorizer,
        notifier,
        config,
        instance_id: Uuid::new_v4().to_string(),
        children: HashMap::new(),
        inbox,
        child_results_tx,
        child_results_rx,
        terminated: false,
    };

    tokio::spawn(orchestrator.run());
    OrchestratorHandle { tx }
}

impl Orchestrator {
    #[instrument(skip(self), fields(subject_id = %self.state.subject_id, instance = %self.instance_id))]
    async fn run(mut self) {
        self.audit(AuditEventKind::OrchestratorStarted, None, None, None, json!({})).await;

        let mut sweep = interval(self.config.expiry_sweep_interval);
        sweep.tick().await; // first tick fires immediately; consume it

        while !self.terminated {
            tokio::select! {
                msg = self.inbox.recv() => {
                    match msg {
                        Some(OrchestratorMessage::Signal(signal)) => self.handle_signal(signal).await,
                        Some(OrchestratorMessage::Query(query, reply)) => {
                            let _ = reply.send(self.handle_query(query));
                        }
                        None => self.terminated = true,
                    }
                }
                Some(result) = self.child_results_rx.recv() => {
                    self.handle_child_result(result).await;
                }
                _ = sweep.tick() => {
                    self.run_expiry_sweep().await;
                }
            }

            self.state.iteration_counter += 1;
            self.maybe_continue_as_new().await;
        }

        self.audit(AuditEventKind::OrchestratorTerminated, None, None, None, json!({})).await;
    }

    async fn maybe_continue_as_new(&mut self) {
        if self.state.iteration_counter < self.config.continue_as_new_iteration_cap {
            return;
        }
        info!(subject = %self.state.subject_id, "continue-as-new threshold reached");
        self.audit(
            AuditEventKind::OrchestratorTerminated,
            None,
            None,
            None,
            json!({ "reason": "continue_as_new" }),
        )
        .await;
        self.instance_id = Uuid::new_v4().to_string();
        self.state.iteration_counter = 0;
        self.audit(
            AuditEventKind::OrchestratorStarted,
            None,
            None,
            None,
            json!({ "reason": "continue_as_new" }),
        )
        .await;
    }

    // ---- signal handling ----------------------------------------------

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::StartMethod { method, params } => self.handle_start_method(method, params).await,
            Signal::VerifierConfirmation { token, verifier_id, .. } => {
                self.route_two_party_signal(token, verifier_id).await
            }
            Signal::ReviewerDecision { attempt_id, reviewer_id, approved, notes } => {
                self.route_government_id_signal(attempt_id, reviewer_id, approved, notes).await
            }
            Signal::SubmitCode { attempt_id, code } => self.route_email_phone_signal(attempt_id, code).await,
            Signal::CommunityAttestation { attestor_id, method, .. } => {
                self.handle_community_attestation(method, attestor_id).await
            }
            Signal::RevokeMethod { method, reason } => self.handle_revoke(method, reason).await,
            Signal::HistoryMilestone { method, value } => self.handle_history_milestone(method, value).await,
            Signal::Terminate { reason } => self.handle_terminate(reason).await,
        }
    }

    fn active_attempt_id(&self, method: Method) -> Option<String> {
        self.state
            .active_attempts
            .values()
            .find(|a| a.method == method && !a.state.is_terminal())
            .map(|a| a.attempt_id.clone())
    }

    async fn handle_start_method(&mut self, method: Method, params: Value) {
        if !method.applicable_kinds().contains(&self.state.kind) {
            self.audit(
                AuditEventKind::AttemptStarted,
                None,
                Some(method),
                None,
                json!({ "rejected": "method not applicable to subject kind" }),
            )
            .await;
            return;
        }
        if self.active_attempt_id(method).is_some() {
            // idempotent: an in-flight attempt already covers this method
            return;
        }

        let now = Utc::now();
        let deadline = match method {
            Method::Email | Method::Phone => self.config.code_method_deadline,
            Method::GovernmentId => self.config.id_review_deadline,
            Method::InPersonTwoParty => self.config.two_party_deadline,
            _ => {
                self.audit(
                    AuditEventKind::AttemptStarted,
                    None,
                    Some(method),
                    None,
                    json!({ "rejected": "no child workflow implemented for this method" }),
                )
                .await;
                return;
            }
        };

        let attempt = VerificationAttempt::new(self.state.subject_id.clone(), method, now + deadline, now);
        let attempt_id = attempt.attempt_id.clone();
        if let Err(e) = self.store.upsert_attempt(attempt.clone()).await {
            warn!("failed to persist new attempt: {e}");
            return;
        }
        self.state.active_attempts.insert(attempt_id.clone(), attempt);
        self.audit(AuditEventKind::AttemptStarted, None, Some(method), Some(attempt_id.clone()), json!({})).await;

        let deadline_instant = Instant::now() + deadline;
        match method {
            Method::Email | Method::Phone => {
                let (tx, rx) = mpsc::channel(8);
                self.children.insert(attempt_id.clone(), ChildSender::EmailPhone(tx));
                let subject_id = self.state.subject_id.clone();
                let notifier = self.notifier.clone();
                let results_tx = self.child_results_tx.clone();
                let spawned_attempt_id = attempt_id.clone();
                tokio::spawn(async move {
                    let outcome = email_phone::run(subject_id, method, deadline_instant, rx, notifier).await;
                    let _ = results_tx.send(ChildResult { attempt_id: spawned_attempt_id, outcome }).await;
                });
            }
            Method::GovernmentId => {
                let upload = government_id::UploadMetadata {
                    format: params.get("format").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    size_bytes: params.get("size_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
                    readable: params.get("readable").and_then(|v| v.as_bool()).unwrap_or(false),
                };
                let (tx, rx) = mpsc::channel(8);
                self.children.insert(attempt_id.clone(), ChildSender::GovernmentId(tx));
                let subject_id = self.state.subject_id.clone();
                let results_tx = self.child_results_tx.clone();
                let spawned_attempt_id = attempt_id.clone();
                tokio::spawn(async move {
                    let outcome = government_id::run(subject_id, upload, deadline_instant, rx).await;
                    let _ = results_tx.send(ChildResult { attempt_id: spawned_attempt_id, outcome }).await;
                });
            }
            Method::InPersonTwoParty => {
                let ttl = chrono::Duration::from_std(self.config.qr_token_ttl).unwrap_or(qr::QR_TOKEN_TTL);
                let tokens = qr::issue_pair(&attempt_id, now, ttl);
                if let Err(e) = self.store.issue_qr_tokens(tokens.to_vec()).await {
                    warn!("failed to issue qr tokens: {e}");
                    return;
                }
                for token in &tokens {
                    self.audit(
                        AuditEventKind::QrIssued,
                        None,
                        Some(method),
                        Some(attempt_id.clone()),
                        json!({ "slot": token.slot }),
                    )
                    .await;
                }

                let (tx, rx) = mpsc::channel(8);
                self.children.insert(attempt_id.clone(), ChildSender::TwoParty(tx));
                let subject_id = self.state.subject_id.clone();
                let store = self.store.clone();
                let authorizer = self.authorizer.clone();
                let instance_id = self.instance_id.clone();
                let results_tx = self.child_results_tx.clone();
                let spawned_attempt_id = attempt_id.clone();
                tokio::spawn(async move {
                    let outcome = two_party::run(
                        subject_id,
                        spawned_attempt_id.clone(),
                        deadline_instant,
                        store,
                        authorizer,
                        instance_id,
                        rx,
                    )
                    .await;
                    let _ = results_tx.send(ChildResult { attempt_id: spawned_attempt_id, outcome }).await;
                });
            }
            _ => unreachable!("filtered above"),
        }
    }

    async fn route_two_party_signal(&mut self, token: String, verifier_id: String) {
        let Some(attempt_id) = self.active_attempt_id(Method::InPersonTwoParty) else {
            return;
        };
        if let Some(ChildSender::TwoParty(tx)) = self.children.get(&attempt_id) {
            let _ = tx.send(two_party::TwoPartySignal::VerifierConfirmation { token, verifier_id }).await;
        }
    }

    async fn route_government_id_signal(
        &mut self,
        attempt_id: String,
        reviewer_id: String,
        approved: bool,
        notes: Option<String>,
    ) {
        if let Some(ChildSender::GovernmentId(tx)) = self.children.get(&attempt_id) {
            let _ = tx
                .send(government_id::GovernmentIdSignal::ReviewerDecision { reviewer_id, approved, notes })
                .await;
        }
    }

    async fn route_email_phone_signal(&mut self, attempt_id: String, code: String) {
        if let Some(ChildSender::EmailPhone(tx)) = self.children.get(&attempt_id) {
            let _ = tx.send(email_phone::EmailPhoneSignal::SubmitCode { code }).await;
        }
    }

    async fn handle_community_attestation(&mut self, method: Method, attestor_id: String) {
        if !method.applicable_kinds().contains(&self.state.kind) {
            return;
        }
        match community_attestation::record_attestation(&self.state.subject_id, method, &attestor_id, &self.store).await {
            Ok(proposal) => {
                self.upsert_completion_and_recompute(
                    method,
                    proposal.count,
                    proposal.metadata,
                    proposal.source_verification_id,
                )
                .await;
            }
            Err(e) => warn!("failed to record attestation: {e}"),
        }
    }

    async fn handle_history_milestone(&mut self, method: Method, value: u32) {
        if !method.is_passive() {
            warn!(?method, "history_milestone signal for a non-passive method, ignoring");
            return;
        }
        let count = value.max(1);
        self.upsert_completion_and_recompute(method, count, HashMap::new(), None).await;
    }

    async fn handle_revoke(&mut self, method: Method, reason: String) {
        if let Err(e) = self.store.retract_completion(&self.state.subject_id, method).await {
            warn!("failed to retract completion: {e}");
            return;
        }
        if let Some(c) = self.state.completions.get_mut(&method) {
            c.revoked = true;
        }
        let now = Utc::now();
        let changed = self.state.recompute(now);
        self.audit(AuditEventKind::Revoked, None, Some(method), None, json!({ "reason": reason })).await;
        if let Some(new_level) = changed {
            self.emit_level_changed(new_level).await;
        }
        self.notifier
            .notify(Notification {
                subject_id: self.state.subject_id.clone(),
                kind: NotificationKind::VerificationFailed,
                data: json!({ "method": method, "reason": "revoked" }),
            })
            .await;
    }

    async fn handle_terminate(&mut self, reason: String) {
        info!(subject = %self.state.subject_id, %reason, "terminating orchestrator, cancelling active children");
        self.children.clear(); // dropping the senders closes each child's channel
        self.audit(AuditEventKind::OrchestratorTerminated, None, None, None, json!({ "reason": reason })).await;
        self.terminated = true;
    }

    // ---- child result handling -----------------------------------------

    async fn handle_child_result(&mut self, result: ChildResult) {
        self.children.remove(&result.attempt_id);
        let Some(attempt) = self.state.active_attempts.get(&result.attempt_id).cloned() else {
            return;
        };

        match result.outcome {
            ChildOutcome::Completed(proposal) => {
                let mut attempt = attempt;
                attempt.state = AttemptState::Completed;
                let _ = self.store.upsert_attempt(attempt.clone()).await;
                self.state.active_attempts.remove(&result.attempt_id);
                self.audit(
                    AuditEventKind::AttemptStateChanged,
                    None,
                    Some(proposal.method),
                    Some(result.attempt_id.clone()),
                    json!({ "state": "completed" }),
                )
                .await;
                self.upsert_completion_and_recompute(
                    proposal.method,
                    proposal.count,
                    proposal.metadata,
                    proposal.source_verification_id,
                )
                .await;
            }
            ChildOutcome::Failed { method, reason } => {
                let mut attempt = attempt;
                attempt.state = match reason {
                    ChildFailure::Timeout => AttemptState::Expired,
                    ChildFailure::Cancelled => AttemptState::Revoked,
                    _ => AttemptState::Rejected,
                };
                let _ = self.store.upsert_attempt(attempt.clone()).await;
                self.state.active_attempts.remove(&result.attempt_id);
                self.audit(
                    AuditEventKind::AttemptStateChanged,
                    None,
                    Some(method),
                    Some(result.attempt_id.clone()),
                    json!({ "state": format!("{:?}", attempt.state), "reason": format!("{:?}", reason) }),
                )
                .await;
                self.notifier
                    .notify(Notification {
                        subject_id: self.state.subject_id.clone(),
                        kind: NotificationKind::VerificationFailed,
                        data: json!({ "method": method, "reason": format!("{:?}", reason) }),
                    })
                    .await;
            }
        }
    }

    async fn upsert_completion_and_recompute(
        &mut self,
        method: Method,
        count: u32,
        metadata: HashMap<String, String>,
        source_verification_id: Option<String>,
    ) {
        let now = Utc::now();
        let completion =
            MethodCompletion::new(self.state.subject_id.clone(), method, count, now, metadata, source_verification_id);
        let points_awarded = completion.points_awarded;
        if let Err(e) = self.store.upsert_completion(completion.clone()).await {
            warn!("failed to persist completion: {e}");
            return;
        }
        self.state.completions.insert(method, completion);
        self.audit(AuditEventKind::CompletionUpserted, None, Some(method), None, json!({})).await;
        self.audit(
            AuditEventKind::PointsAwarded,
            None,
            Some(method),
            None,
            json!({ "points_awarded": points_awarded }),
        )
        .await;

        let changed = self.state.recompute(now);
        if let Some(new_level) = changed {
            self.emit_level_changed(new_level).await;
        }
    }

    async fn emit_level_changed(&mut self, new_level: Level) {
        self.audit(
            AuditEventKind::LevelChanged,
            None,
            None,
            None,
            json!({ "new_level": new_level }),
        )
        .await;
        self.notifier
            .notify(Notification {
                subject_id: self.state.subject_id.clone(),
                kind: NotificationKind::LevelChange,
                data: json!({ "new_level": new_level }),
            })
            .await;
    }

    // ---- expiry sweep ----------------------------------------------------

    async fn run_expiry_sweep(&mut self) {
        let now = Utc::now();
        let expired: Vec<Method> = self
            .state
            .completions
            .values()
            .filter(|c| !c.revoked && c.expires_at.map(|e| e <= now).unwrap_or(false))
            .map(|c| c.method)
            .collect();

        if expired.is_empty() {
            self.state.last_expiry_sweep_at = Some(now);
            return;
        }

        for method in expired {
            if let Err(e) = self.store.retract_completion(&self.state.subject_id, method).await {
                warn!("failed to retract expired completion: {e}");
                continue;
            }
            if let Some(c) = self.state.completions.get_mut(&method) {
                c.revoked = true;
            }
            self.audit(AuditEventKind::Expired, None, Some(method), None, json!({})).await;
        }

        let changed = self.state.recompute(now);
        if let Some(new_level) = changed {
            self.emit_level_changed(new_level).await;
        }
        self.state.last_expiry_sweep_at = Some(now);
    }

    // ---- queries -----------------------------------------------------------

    fn handle_query(&self, query: Query) -> QueryResponse {
        match query {
            Query::TrustScore => QueryResponse::TrustScore(self.state.trust_score),
            Query::Level => QueryResponse::Level(self.state.level),
            Query::Completions => QueryResponse::Completions(self.state.completions.values().cloned().collect()),
            Query::NextLevelInfo => QueryResponse::NextLevelInfo(self.state.next_level_info()),
            Query::ActiveAttempts => {
                QueryResponse::ActiveAttempts(self.state.active_attempts.values().cloned().collect())
            }
            Query::Composite => QueryResponse::Composite(CompositeView {
                trust_score: self.state.trust_score,
                level: self.state.level,
                completions: self.state.completions.values().cloned().collect(),
                next_level_info: self.state.next_level_info(),
                active_attempts: self.state.active_attempts.values().cloned().collect(),
            }),
        }
    }

    // ---- audit -----------------------------------------------------------

    async fn audit(
        &self,
        kind: AuditEventKind,
        actor_id: Option<String>,
        method: Option<Method>,
        attempt_id: Option<String>,
        data: Value,
    ) {
        let event = AuditEvent::new(
            self.state.subject_id.clone(),
            kind,
            actor_id,
            method,
            attempt_id,
            data,
            Utc::now(),
            self.instance_id.clone(),
        );
        if let Err(e) = self.store.record_event(event).await {
            warn!("failed to record audit event: {e}");
        }
    }
}

/// Map a store/validation error into the orchestrator-visible taxonomy
/// for callers that need a typed result rather than a fire-and-forget
/// signal (used by `registry` when a subject kind mismatch is detected
/// at start time).
pub fn validation_error(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Validation(msg.into())
}
