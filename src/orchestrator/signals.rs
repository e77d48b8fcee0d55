//! Inbound signal/query vocabulary (§4.6, §6). Signals are the only way
//! to mutate orchestrator state; queries are non-blocking snapshots.
//! Mirrors the "decorator-marked handlers become a dispatch table"
//! REDESIGN FLAGS note — `Signal`/`Query` are the dispatch table's keys,
//! matched in `orchestrator::Orchestrator::handle_signal` /
//! `handle_query`.

use crate::method::Method;
use crate::model::{AuditEvent, MethodCompletion, VerificationAttempt};
use crate::scoring::{Level, NextLevelInfo};
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum Signal {
    StartMethod {
        method: Method,
        params: Value,
    },
    VerifierConfirmation {
        token: String,
        verifier_id: String,
        location: Option<String>,
        device_fp: Option<String>,
    },
    ReviewerDecision {
        attempt_id: String,
        reviewer_id: String,
        approved: bool,
        notes: Option<String>,
    },
    SubmitCode {
        attempt_id: String,
        code: String,
    },
    CommunityAttestation {
        attestor_id: String,
        method: Method,
        attestation_data: Value,
    },
    RevokeMethod {
        method: Method,
        reason: String,
    },
    HistoryMilestone {
        method: Method,
        value: u32,
    },
    Terminate {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum Query {
    TrustScore,
    Level,
    Completions,
    NextLevelInfo,
    ActiveAttempts,
    /// A single consistent composite view — use this instead of issuing
    /// several queries back to back when consistency across fields
    /// matters (§6: "callers MUST NOT assume consistency across two
    /// separate queries").
    Composite,
}

#[derive(Debug, Clone)]
pub enum QueryResponse {
    TrustScore(u32),
    Level(Level),
    Completions(Vec<MethodCompletion>),
    NextLevelInfo(NextLevelInfo),
    ActiveAttempts(Vec<VerificationAttempt>),
    Composite(CompositeView),
    /// Returned if the orchestrator has already terminated.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct CompositeView {
    pub trust_score: u32,
    pub level: Level,
    pub completions: Vec<MethodCompletion>,
    pub next_level_info: NextLevelInfo,
    pub active_attempts: Vec<VerificationAttempt>,
}

/// Recent audit events, exposed for diagnostics/tests; not part of the
/// spec's formal query set but convenient for scenario assertions.
#[derive(Debug, Clone)]
pub struct AuditLog(pub Vec<AuditEvent>);
