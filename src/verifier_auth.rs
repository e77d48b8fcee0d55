//! Verifier authorization (§4.4): an ordered rule engine deciding whether
//! a principal may act as verifier for a given subject/method, plus the
//! 24h credential re-check cache. Grounded on the guardian-eligibility
//! checks in `src/guardians.rs` (ordered, short-circuiting predicate
//! chain over a profile struct) and on
//! `original_source/src/nabr/temporal/activities/verification/verifier_authorization.py`
//! for the exact rule ordering and auto-qualifying credential list.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{VerifierProfile, AUTO_QUALIFYING_CREDENTIALS};
use crate::scoring::Level;
use crate::store::VerificationStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, instrument};

/// How long a verifier's cached credential check remains valid before the
/// next authorization decision forces a re-check.
pub const CREDENTIAL_CACHE_TTL: Duration = Duration::hours(24);

/// Minimum rating for the `trusted_verifier` and `community_leader` rules.
const TRUSTED_RATING_THRESHOLD: f64 = 4.0;

/// Minimum distinct attested subjects for the `trusted_verifier` rule.
const TRUSTED_ATTESTED_COUNT: u32 = 50;

pub struct VerifierAuthorizer {
    store: Arc<dyn VerificationStore>,
}

impl VerifierAuthorizer {
    pub fn new(store: Arc<dyn VerificationStore>) -> Self {
        Self { store }
    }

    /// Decide whether `verifier_id` may confirm `subject_id` for `method`
    /// right now. Applies, in order: self-verification prohibition,
    /// profile existence, revocation, minimum own-level, then the
    /// qualifying-credential rules. The first disqualifying rule wins.
    #[instrument(skip(self))]
    pub async fn authorize(
        &self,
        subject_id: &str,
        verifier_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        if subject_id == verifier_id {
            return Err(OrchestratorError::Authorization(
                "a subject may not verify itself".to_string(),
            ));
        }

        let profile = self
            .store
            .get_verifier_profile(verifier_id)
            .await
            .map_err(|e| OrchestratorError::TransientStorage(e.to_string()))?
            .ok_or_else(|| OrchestratorError::Authorization(format!("no verifier profile for {verifier_id}")))?;

        let profile = self.refresh_if_stale(profile, now).await?;

        if profile.revoked {
            return Err(OrchestratorError::Authorization(format!(
                "verifier {verifier_id} has been revoked{}",
                profile
                    .revoked_reason
                    .as_ref()
                    .map(|r| format!(": {r}"))
                    .unwrap_or_default()
            )));
        }

        if !profile.authorized {
            return Err(OrchestratorError::Authorization(format!(
                "verifier {verifier_id} is not authorized"
            )));
        }

        if profile.own_level < Level::Minimal {
            return Err(OrchestratorError::Authorization(format!(
                "verifier {verifier_id} has not reached Minimal trust themselves"
            )));
        }

        if self.is_qualified(&profile) {
            Ok(())
        } else {
            Err(OrchestratorError::Authorization(format!(
                "verifier {verifier_id} does not meet any qualifying rule"
            )))
        }
    }

    /// Distinctness requirement for two-party in-person verification:
    /// neither slot's verifier may equal the subject, and the two
    /// verifiers must not be the same principal.
    pub fn check_two_party_distinctness(
        subject_id: &str,
        verifier_a: &str,
        verifier_b: &str,
    ) -> OrchestratorResult<()> {
        if verifier_a == verifier_b {
            return Err(OrchestratorError::Validation(
                "two-party verification requires two distinct verifiers".to_string(),
            ));
        }
        if verifier_a == subject_id || verifier_b == subject_id {
            return Err(OrchestratorError::Validation(
                "a subject may not verify itself".to_string(),
            ));
        }
        Ok(())
    }

    /// auto_qualified flag, an auto-qualifying credential, or the
    /// trusted_verifier / community_leader rating+count rules.
    fn is_qualified(&self, profile: &VerifierProfile) -> bool {
        if profile.auto_qualified {
            return true;
        }
        if profile
            .credentials
            .iter()
            .any(|c| AUTO_QUALIFYING_CREDENTIALS.contains(&c.as_str()))
        {
            return true;
        }
        let trusted_verifier =
            profile.attested_count >= TRUSTED_ATTESTED_COUNT && profile.rating >= TRUSTED_RATING_THRESHOLD;
        let community_leader =
            profile.credentials.iter().any(|c| c == "community_leader") && profile.rating >= TRUSTED_RATING_THRESHOLD;
        trusted_verifier || community_leader
    }

    /// If the cached credential check is older than `CREDENTIAL_CACHE_TTL`,
    /// re-persist the profile with a refreshed timestamp. The actual
    /// credential values are assumed current in the store (external
    /// credential systems write through `upsert_verifier_profile`); this
    /// only manages the cache staleness marker, mirroring
    /// `federation-lifecycle/src/executor.rs`'s periodic re-validation.
    async fn refresh_if_stale(
        &self,
        mut profile: VerifierProfile,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<VerifierProfile> {
        let stale = match profile.last_credential_check_at {
            Some(checked_at) => now - checked_at > CREDENTIAL_CACHE_TTL,
            None => true,
        };
        if stale {
            debug!(verifier = %profile.principal_id, "credential cache stale, refreshing");
            profile.last_credential_check_at = Some(now);
            self.store
                .upsert_verifier_profile(profile.clone())
                .await
                .map_err(|e| OrchestratorError::TransientStorage(e.to_string()))?;
        }
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn base_profile(id: &str) -> VerifierProfile {
        VerifierProfile {
            principal_id: id.to_string(),
            authorized: true,
            auto_qualified: false,
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

    #[tokio::test]
    async fn self_verification_is_rejected() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        let authz = VerifierAuthorizer::new(store);
        let err = authz.authorize("s1", "s1", Utc::now()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Authorization(_)));
    }

    #[tokio::test]
    async fn auto_qualifying_credential_passes() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        let mut profile = base_profile("v1");
        profile.credentials.push("notary".to_string());
        store.upsert_verifier_profile(profile).await.unwrap();

        let authz = VerifierAuthorizer::new(store);
        authz.authorize("s1", "v1", Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn unqualified_verifier_is_rejected() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        store.upsert_verifier_profile(base_profile("v1")).await.unwrap();

        let authz = VerifierAuthorizer::new(store);
        let err = authz.authorize("s1", "v1", Utc::now()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Authorization(_)));
    }

    #[tokio::test]
    async fn trusted_verifier_rule() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        let mut profile = base_profile("v1");
        profile.attested_count = 50;
        profile.rating = 4.0;
        store.upsert_verifier_profile(profile).await.unwrap();

        let authz = VerifierAuthorizer::new(store);
        authz.authorize("s1", "v1", Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn revoked_verifier_is_rejected_even_if_otherwise_qualified() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        let mut profile = base_profile("v1");
        profile.auto_qualified = true;
        profile.revoked = true;
        profile.revoked_reason = Some("fraud report".to_string());
        store.upsert_verifier_profile(profile).await.unwrap();

        let authz = VerifierAuthorizer::new(store);
        let err = authz.authorize("s1", "v1", Utc::now()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Authorization(_)));
    }

    #[test]
    fn two_party_distinctness_rejects_same_verifier_twice() {
        let err = VerifierAuthorizer::check_two_party_distinctness("s1", "v1", "v1").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn two_party_distinctness_rejects_subject_as_verifier() {
        let err = VerifierAuthorizer::check_two_party_distinctness("s1", "s1", "v2").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }
}
