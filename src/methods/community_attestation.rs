//! Community attestation / personal reference workflow (§4.3). Unlike
//! the other methods this has no terminal failure mode and no deadline:
//! it accumulates distinct attestors and is re-entered on every signal,
//! completing (in the sense of producing a fresh completion proposal)
//! each time. Modeled as a plain async function the orchestrator calls
//! directly from its signal dispatch rather than a spawned task with its
//! own outcome channel, since there is nothing to wait on.

use super::CompletionProposal;
use crate::method::Method;
use crate::store::{StoreError, VerificationStore};
use std::sync::Arc;

/// Record one attestation and return the completion proposal reflecting
/// the updated distinct-attestor count. Idempotent per `(attestor_id,
/// method)` — the store dedupes, so resubmitting the same attestor never
/// inflates the count (§9 idempotence keys).
pub async fn record_attestation(
    subject_id: &str,
    method: Method,
    attestor_id: &str,
    store: &Arc<dyn VerificationStore>,
) -> Result<CompletionProposal, StoreError> {
    let count = store.record_attestation(subject_id, method, attestor_id).await?;
    let proposal = CompletionProposal::new(method, count)
        .with_metadata("latest_attestor_id", attestor_id)
        .with_source(attestor_id.to_string());
    Ok(proposal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn third_distinct_attestor_reaches_multiplier_cap() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        let p1 = record_attestation("s1", Method::PersonalReference, "a1", &store).await.unwrap();
        assert_eq!(p1.count, 1);
        let p2 = record_attestation("s1", Method::PersonalReference, "a2", &store).await.unwrap();
        assert_eq!(p2.count, 2);
        let p3 = record_attestation("s1", Method::PersonalReference, "a3", &store).await.unwrap();
        assert_eq!(p3.count, 3);
    }

    #[tokio::test]
    async fn duplicate_attestor_does_not_inflate_count() {
        let store: Arc<dyn VerificationStore> = Arc::new(MemoryStore::new());
        record_attestation("s1", Method::PersonalReference, "a1", &store).await.unwrap();
        let p2 = record_attestation("s1", Method::PersonalReference, "a1", &store).await.unwrap();
        assert_eq!(p2.count, 1, "resubmitting the same attestor must not raise the count");
    }
}
