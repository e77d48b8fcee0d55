//! In-memory `VerificationStore` for tests. Mirrors the
//! `Arc<Mutex<HashMap<...>>>` shape the teacher uses in
//! `src/services/federation_sync.rs`. Guarded by `std::sync::Mutex`
//! rather than `tokio::sync::Mutex`: every access here is a fast,
//! non-blocking in-memory operation, so there is no await point inside
//! the lock and nothing to gain from an async-aware mutex.

use super::{ConsumeOutcome, StoreError, StoreResult, VerificationStore};
use crate::method::Method;
use crate::model::{AuditEvent, MethodCompletion, QrToken, VerificationAttempt, VerifierProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    completions: HashMap<(String, Method), MethodCompletion>,
    attempts: HashMap<String, VerificationAttempt>,
    qr_tokens: HashMap<String, QrToken>,
    confirmations: HashMap<String, Vec<(u8, String)>>,
    verifiers: HashMap<String, VerifierProfile>,
    events: HashMap<String, Vec<AuditEvent>>,
    attestations: HashMap<(String, Method), HashSet<String>>,
}

/// In-memory store. Single process, single instance — fine for tests,
/// not for production (see `store::postgres` for the durable adapter).
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerificationStore for MemoryStore {
    async fn upsert_completion(&self, completion: MethodCompletion) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .completions
            .insert((completion.subject_id.clone(), completion.method), completion);
        Ok(())
    }

    async fn retract_completion(&self, subject_id: &str, method: Method) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.completions.get_mut(&(subject_id.to_string(), method)) {
            c.revoked = true;
        }
        Ok(())
    }

    async fn get_completions(&self, subject_id: &str) -> StoreResult<Vec<MethodCompletion>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .completions
            .values()
            .filter(|c| c.subject_id == subject_id)
            .cloned()
            .collect())
    }

    async fn list_expiring_completions(&self, now: DateTime<Utc>) -> StoreResult<Vec<MethodCompletion>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .completions
            .values()
            .filter(|c| !c.revoked && c.expires_at.map(|e| e < now).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn upsert_attempt(&self, attempt: VerificationAttempt) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.attempts.insert(attempt.attempt_id.clone(), attempt);
        Ok(())
    }

    async fn get_attempt(&self, attempt_id: &str) -> StoreResult<Option<VerificationAttempt>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.attempts.get(attempt_id).cloned())
    }

    async fn active_attempt_for_method(
        &self,
        subject_id: &str,
        method: Method,
    ) -> StoreResult<Option<VerificationAttempt>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .attempts
            .values()
            .find(|a| a.subject_id == subject_id && a.method == method && !a.state.is_terminal())
            .cloned())
    }

    async fn issue_qr_tokens(&self, tokens: Vec<QrToken>) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for t in tokens {
            inner.qr_tokens.insert(t.token.clone(), t);
        }
        Ok(())
    }

    async fn consume_qr_token(&self, token: &str, verifier: &str, now: DateTime<Utc>) -> StoreResult<ConsumeOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let Some(t) = inner.qr_tokens.get_mut(token) else {
            return Ok(ConsumeOutcome::Invalid);
        };
        if t.invalidated {
            return Ok(ConsumeOutcome::Invalid);
        }
        if t.expires_at <= now {
            return Ok(ConsumeOutcome::Expired);
        }
        match &t.consumed_by {
            Some(existing) if existing == verifier => Ok(ConsumeOutcome::AlreadyConsumedBySame),
            Some(_) => Ok(ConsumeOutcome::AlreadyConsumedByOther),
            None => {
                t.consumed_by = Some(verifier.to_string());
                Ok(ConsumeOutcome::Ok)
            }
        }
    }

    async fn invalidate_qr_tokens(&self, attempt_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for t in inner.qr_tokens.values_mut() {
            if t.attempt_id == attempt_id {
                t.invalidated = true;
            }
        }
        Ok(())
    }

    async fn get_qr_tokens(&self, attempt_id: &str) -> StoreResult<Vec<QrToken>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .qr_tokens
            .values()
            .filter(|t| t.attempt_id == attempt_id)
            .cloned()
            .collect())
    }

    async fn record_confirmation(
        &self,
        attempt_id: &str,
        slot: u8,
        verifier_id: &str,
        _now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.confirmations.entry(attempt_id.to_string()).or_default();
        if !list.iter().any(|(s, v)| *s == slot && v == verifier_id) {
            list.retain(|(s, _)| *s != slot);
            list.push((slot, verifier_id.to_string()));
        }
        Ok(())
    }

    async fn revoke_confirmations(&self, attempt_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.confirmations.remove(attempt_id);
        Ok(())
    }

    async fn get_confirmations(&self, attempt_id: &str) -> StoreResult<Vec<(u8, String)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.confirmations.get(attempt_id).cloned().unwrap_or_default())
    }

    async fn get_verifier_profile(&self, principal_id: &str) -> StoreResult<Option<VerifierProfile>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.verifiers.get(principal_id).cloned())
    }

    async fn upsert_verifier_profile(&self, profile: VerifierProfile) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.verifiers.insert(profile.principal_id.clone(), profile);
        Ok(())
    }

    async fn record_event(&self, event: AuditEvent) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.events.entry(event.subject_id.clone()).or_default().push(event);
        Ok(())
    }

    async fn list_events(&self, subject_id: &str) -> StoreResult<Vec<AuditEvent>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.events.get(subject_id).cloned().unwrap_or_default())
    }

    async fn record_attestation(&self, subject_id: &str, method: Method, attestor_id: &str) -> StoreResult<u32> {
        let mut inner = self.inner.lock().unwrap();
        let set = inner
            .attestations
            .entry((subject_id.to_string(), method))
            .or_default();
        set.insert(attestor_id.to_string());
        Ok(set.len() as u32)
    }
}

impl From<std::sync::PoisonError<std::sync::MutexGuard<'_, Inner>>> for StoreError {
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, Inner>>) -> Self {
        StoreError::Transient(format!("lock poisoned: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn qr_consumption_is_exclusive() {
        let store = MemoryStore::new();
        let token = QrToken {
            token: "tok1".to_string(),
            attempt_id: "a1".to_string(),
            slot: 1,
            issued_at: now(),
            expires_at: now() + Duration::hours(1),
            consumed_by: None,
            invalidated: false,
        };
        store.issue_qr_tokens(vec![token]).await.unwrap();

        let r1 = store.consume_qr_token("tok1", "v1", now()).await.unwrap();
        assert_eq!(r1, ConsumeOutcome::Ok);

        let r2 = store.consume_qr_token("tok1", "v1", now()).await.unwrap();
        assert_eq!(r2, ConsumeOutcome::AlreadyConsumedBySame);

        let r3 = store.consume_qr_token("tok1", "v2", now()).await.unwrap();
        assert_eq!(r3, ConsumeOutcome::AlreadyConsumedByOther);
    }

    #[tokio::test]
    async fn attestation_accumulates_distinct_attestors() {
        let store = MemoryStore::new();
        let n1 = store
            .record_attestation("s1", Method::PersonalReference, "a1")
            .await
            .unwrap();
        assert_eq!(n1, 1);
        let n2 = store
            .record_attestation("s1", Method::PersonalReference, "a1")
            .await
            .unwrap();
        assert_eq!(n2, 1, "duplicate attestor must not double-count");
        let n3 = store
            .record_attestation("s1", Method::PersonalReference, "a2")
            .await
            .unwrap();
        assert_eq!(n3, 2);
    }
}
