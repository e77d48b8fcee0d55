//! Email/phone code child workflow (§4.3): generate a 6-digit code,
//! dispatch via the notifier, await `submit_code`, compare in constant
//! time, fail after 3 wrong submissions. Grounded on the signal-driven
//! wait pattern in
//! `original_source/src/nabr/temporal/workflows/verification/methods/` and
//! on the notifier seam in `src/services/federation_sync.rs`.

use super::{ChildFailure, ChildOutcome, CompletionProposal};
use crate::method::Method;
use crate::notifier::{Notification, NotificationKind, Notifier};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

const MAX_WRONG_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub enum EmailPhoneSignal {
    SubmitCode { code: String },
    Cancel,
}

/// Activity: generate a 6-digit numeric code. Randomness lives here, not
/// inline in the workflow body, per §4.3's determinism requirement.
fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{n:06}")
}

/// Byte-for-byte comparison that does not short-circuit on the first
/// mismatch, so wall-clock time leaks no information about which
/// character differed.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub async fn run(
    subject_id: String,
    method: Method,
    deadline: Instant,
    mut signals: mpsc::Receiver<EmailPhoneSignal>,
    notifier: Arc<dyn Notifier>,
) -> ChildOutcome {
    let code = generate_code();
    notifier
        .notify(Notification {
            subject_id: subject_id.clone(),
            kind: NotificationKind::CodeDispatched,
            data: serde_json::json!({ "method": method }),
        })
        .await;

    let mut wrong_attempts = 0u32;

    loop {
        tokio::select! {
            _ = sleep(deadline.saturating_duration_since(Instant::now())) => {
                warn!(subject = %subject_id, ?method, "code submission deadline elapsed");
                return ChildOutcome::Failed { method, reason: ChildFailure::Timeout };
            }
            signal = signals.recv() => {
                match signal {
                    None | Some(EmailPhoneSignal::Cancel) => {
                        return ChildOutcome::Failed { method, reason: ChildFailure::Cancelled };
                    }
                    Some(EmailPhoneSignal::SubmitCode { code: submitted }) => {
                        if constant_time_eq(&submitted, &code) {
                            info!(subject = %subject_id, ?method, "code verified");
                            return ChildOutcome::Completed(CompletionProposal::new(method, 1));
                        }
                        wrong_attempts += 1;
                        warn!(subject = %subject_id, ?method, wrong_attempts, "wrong code submitted");
                        if wrong_attempts >= MAX_WRONG_ATTEMPTS {
                            return ChildOutcome::Failed { method, reason: ChildFailure::RejectedByReviewer };
                        }
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
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("123456", "123456"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatch() {
        assert!(!constant_time_eq("123456", "654321"));
        assert!(!constant_time_eq("123", "123456"));
    }

    #[test]
    fn generated_code_is_six_digits() {
        let code = generate_code();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }
}
