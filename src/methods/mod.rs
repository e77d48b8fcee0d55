//! Method child workflows (§4.3). Each method runs as its own `tokio`
//! task, a single-threaded coroutine suspended only on a signal, a timer,
//! or an activity future — mirroring the orchestrator's own suspension
//! discipline (§5). The orchestrator owns the task's `JoinHandle` and a
//! `mpsc::Sender` used to route inbound signals to it; the task replies
//! with exactly one `ChildOutcome` when it finishes.

pub mod community_attestation;
pub mod email_phone;
pub mod government_id;
pub mod two_party;

use crate::method::Method;
use std::collections::HashMap;

/// What a successful child hands back to the orchestrator for it to turn
/// into a `MethodCompletion` (the orchestrator, not the child, owns
/// point awarding and persistence — §4.6).
#[derive(Debug, Clone)]
pub struct CompletionProposal {
    pub method: Method,
    pub count: u32,
    pub metadata: HashMap<String, String>,
    pub source_verification_id: Option<String>,
}

impl CompletionProposal {
    pub fn new(method: Method, count: u32) -> Self {
        Self {
            method,
            count,
            metadata: HashMap::new(),
            source_verification_id: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_source(mut self, source_verification_id: impl Into<String>) -> Self {
        self.source_verification_id = Some(source_verification_id.into());
        self
    }
}

/// Typed failure outcomes a child workflow can surface (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildFailure {
    Timeout,
    RejectedByReviewer,
    InvalidInput,
    VerifierUnauthorized,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum ChildOutcome {
    Completed(CompletionProposal),
    Failed { method: Method, reason: ChildFailure },
}
