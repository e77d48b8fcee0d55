//! Government-ID review child workflow (§4.3): validate upload metadata,
//! enqueue for a human reviewer, await `reviewer_decision` on a
//! multi-day deadline. Grounded on the long-deadline human-review
//! pattern in `original_source/src/nabr/temporal/activities/verification/`
//! and on `src/guardians.rs`'s review-queue shape.

use super::{ChildFailure, ChildOutcome, CompletionProposal};
use crate::method::Method;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub format: String,
    pub size_bytes: u64,
    pub readable: bool,
}

#[derive(Debug, Clone)]
pub enum GovernmentIdSignal {
    ReviewerDecision {
        reviewer_id: String,
        approved: bool,
        notes: Option<String>,
    },
    Cancel,
}

/// Activity: format/size/readability checks on the uploaded document.
/// Mirrors spec step 1; no network or storage I/O, so it is safe to run
/// inline rather than spawn as a separate activity call.
fn validate_upload(upload: &UploadMetadata) -> bool {
    const MAX_BYTES: u64 = 20 * 1024 * 1024;
    let known_format = matches!(upload.format.as_str(), "jpeg" | "png" | "pdf");
    known_format && upload.readable && upload.size_bytes > 0 && upload.size_bytes <= MAX_BYTES
}

pub async fn run(
    subject_id: String,
    upload: UploadMetadata,
    deadline: Instant,
    mut signals: mpsc::Receiver<GovernmentIdSignal>,
) -> ChildOutcome {
    if !validate_upload(&upload) {
        warn!(subject = %subject_id, "government id upload failed validation");
        return ChildOutcome::Failed {
            method: Method::GovernmentId,
            reason: ChildFailure::InvalidInput,
        };
    }

    info!(subject = %subject_id, "government id queued for reviewer");

    loop {
        tokio::select! {
            _ = sleep(deadline.saturating_duration_since(Instant::now())) => {
                warn!(subject = %subject_id, "government id review deadline elapsed");
                return ChildOutcome::Failed { method: Method::GovernmentId, reason: ChildFailure::Timeout };
            }
            signal = signals.recv() => {
                match signal {
                    None | Some(GovernmentIdSignal::Cancel) => {
                        return ChildOutcome::Failed { method: Method::GovernmentId, reason: ChildFailure::Cancelled };
                    }
                    Some(GovernmentIdSignal::ReviewerDecision { reviewer_id, approved, notes }) => {
                        if approved {
                            info!(subject = %subject_id, reviewer = %reviewer_id, "government id approved");
                            let mut proposal = CompletionProposal::new(Method::GovernmentId, 1)
                                .with_metadata("reviewer_id", reviewer_id);
                            if let Some(notes) = notes {
                                proposal = proposal.with_metadata("notes", notes);
                            }
                            return ChildOutcome::Completed(proposal);
                        }
                        warn!(subject = %subject_id, reviewer = %reviewer_id, "government id rejected");
                        return ChildOutcome::Failed { method: Method::GovernmentId, reason: ChildFailure::RejectedByReviewer };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_upload() {
        let upload = UploadMetadata {
            format: "jpeg".to_string(),
            size_bytes: 100 * 1024 * 1024,
            readable: true,
        };
        assert!(!validate_upload(&upload));
    }

    #[test]
    fn rejects_unknown_format() {
        let upload = UploadMetadata {
            format: "bmp".to_string(),
            size_bytes: 1024,
            readable: true,
        };
        assert!(!validate_upload(&upload));
    }

    #[test]
    fn accepts_well_formed_upload() {
        let upload = UploadMetadata {
            format: "pdf".to_string(),
            size_bytes: 1024,
            readable: true,
        };
        assert!(validate_upload(&upload));
    }

    #[tokio::test]
    async fn invalid_upload_fails_immediately() {
        let (_tx, rx) = mpsc::channel(1);
        let upload = UploadMetadata {
            format: "bmp".to_string(),
            size_bytes: 1,
            readable: true,
        };
        let outcome = run("s1".to_string(), upload, Instant::now() + std::time::Duration::from_secs(60), rx).await;
        assert!(matches!(
            outcome,
            ChildOutcome::Failed { reason: ChildFailure::InvalidInput, .. }
        ));
    }
}
