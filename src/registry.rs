//! `OrchestratorRegistry`: the external surface's spawn/lookup table
//! (§2 component 7, §6 "Start orchestrator"). One instance per process;
//! owns the map from `subject_id` to a live `OrchestratorHandle` and is
//! the only code path allowed to call `orchestrator::spawn`. Grounded on
//! `src/services/federation_sync.rs`'s `Arc<Mutex<HashMap<...>>>`
//! registry shape.

use crate::config::Config;
use crate::method::SubjectKind;
use crate::notifier::Notifier;
use crate::orchestrator::{self, snapshot::TrustState, OrchestratorHandle};
use crate::store::VerificationStore;
use crate::verifier_auth::VerifierAuthorizer;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub struct OrchestratorRegistry {
    store: Arc<dyn VerificationStore>,
    authorizer: Arc<VerifierAuthorizer>,
    notifier: Arc<dyn Notifier>,
    config: Arc<Config>,
    handles: Mutex<HashMap<String, OrchestratorHandle>>,
}

impl OrchestratorRegistry {
    pub fn new(
        store: Arc<dyn VerificationStore>,
        notifier: Arc<dyn Notifier>,
        config: Arc<Config>,
    ) -> Self {
        let authorizer = Arc::new(VerifierAuthorizer::new(store.clone()));
        Self {
            store,
            authorizer,
            notifier,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Return the existing handle for `subject_id`, or spawn a fresh
    /// instance keyed by it (§6: "Start orchestrator ... Creates
    /// instance keyed by `subject_id`"). Idempotent: a second call for
    /// the same subject returns the same running instance.
    pub async fn get_or_start(&self, subject_id: &str, kind: SubjectKind) -> OrchestratorHandle {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(subject_id) {
            return handle.clone();
        }
        info!(%subject_id, ?kind, "starting new orchestrator instance");
        let handle = orchestrator::spawn(
            subject_id.to_string(),
            kind,
            self.store.clone(),
            self.authorizer.clone(),
            self.notifier.clone(),
            self.config.clone(),
        );
        handles.insert(subject_id.to_string(), handle.clone());
        handle
    }

    /// Hydrate an orchestrator from a previously-persisted snapshot
    /// (e.g. after a process restart, not to be confused with the
    /// in-process continue-as-new the orchestrator performs itself).
    pub async fn start_from_snapshot(&self, state: TrustState) -> OrchestratorHandle {
        let subject_id = state.subject_id.clone();
        let handle = orchestrator::spawn_from_state(
            state,
            self.store.clone(),
            self.authorizer.clone(),
            self.notifier.clone(),
            self.config.clone(),
        );
        self.handles.lock().await.insert(subject_id, handle.clone());
        handle
    }

    pub async fn lookup(&self, subject_id: &str) -> Option<OrchestratorHandle> {
        self.handles.lock().await.get(subject_id).cloned()
    }
}
