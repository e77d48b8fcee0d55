//! Notifier collaborator (§6 External surface, §7 propagation policy).
//! Wire format and transport are explicitly out of scope (§1 Non-goals);
//! this module only fixes the seam — a trait the orchestrator dispatches
//! `level_change` / `verification_failed` / `reviewer_rejected` /
//! `attempt_expired` events through, plus a logging-only stub
//! implementation suitable for tests and for standing the binary up
//! before a real transport is wired in.

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub enum NotificationKind {
    LevelChange,
    VerificationFailed,
    ReviewerRejected,
    AttemptExpired,
    /// Not one of §7's user-visible failure notifications, but the
    /// dispatch step email/phone code methods need (§4.3 step 2); the
    /// wire format and transport are out of scope (§1), only the seam.
    CodeDispatched,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub subject_id: String,
    pub kind: NotificationKind,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Logs notifications instead of sending them. The real transport
/// (email/SMS) is out of scope per §1.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, notification: Notification) {
        info!(
            subject_id = %notification.subject_id,
            kind = ?notification.kind,
            data = %notification.data,
            "notification dispatched"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_notifier_does_not_panic() {
        let notifier = LoggingNotifier;
        notifier
            .notify(Notification {
                subject_id: "s1".to_string(),
                kind: NotificationKind::LevelChange,
                data: serde_json::json!({"from": "unverified", "to": "minimal"}),
            })
            .await;
    }
}
