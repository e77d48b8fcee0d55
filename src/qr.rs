//! QR token generation for two-party in-person verification (§4.3, §6).
//! Grounded on
//! `original_source/src/nabr/temporal/activities/verification/qr_generation.py`
//! for the entropy/encoding choice (raw random bytes, URL-safe base64, no
//! padding) and on `icn-runtime-root/crates/icn-identity/src/keypair.rs`
//! for the teacher's `rand`-then-encode idiom.

use crate::model::QrToken;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

/// 24 bytes = 192 bits of entropy per token, exceeding spec's floor.
const TOKEN_BYTES: usize = 24;

/// Default TTL, used by callers (and tests) that don't have a `Config`
/// handy. The orchestrator itself always passes `config.qr_token_ttl`.
pub const QR_TOKEN_TTL: Duration = Duration::minutes(15);

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Issue one token per verifier slot (two-party verification always has
/// exactly two: slot 0 and slot 1). `ttl` is caller-supplied so operators
/// can tune it independently of the two-party attempt deadline — a short
/// TTL suits a remote code exchange, but an in-person meeting may need
/// longer than the 15-minute default to actually happen.
pub fn issue_pair(attempt_id: &str, now: DateTime<Utc>, ttl: Duration) -> [QrToken; 2] {
    let expires_at = now + ttl;
    [
        QrToken {
            token: random_token(),
            attempt_id: attempt_id.to_string(),
            slot: 0,
            issued_at: now,
            expires_at,
            consumed_by: None,
            invalidated: false,
        },
        QrToken {
            token: random_token(),
            attempt_id: attempt_id.to_string(),
            slot: 1,
            issued_at: now,
            expires_at,
            consumed_by: None,
            invalidated: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_are_distinct_and_unexpired() {
        let now = Utc::now();
        let [a, b] = issue_pair("attempt-1", now, QR_TOKEN_TTL);
        assert_ne!(a.token, b.token);
        assert_ne!(a.slot, b.slot);
        assert!(a.is_valid(now));
        assert!(b.is_valid(now));
    }

    #[test]
    fn tokens_carry_enough_entropy() {
        let now = Utc::now();
        let [a, _] = issue_pair("attempt-1", now, QR_TOKEN_TTL);
        // URL_SAFE_NO_PAD of 24 bytes encodes to 32 chars, no '=' padding.
        assert_eq!(a.token.len(), 32);
        assert!(!a.token.contains('='));
    }
}
