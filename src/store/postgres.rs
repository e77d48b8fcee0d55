//! Postgres-backed `VerificationStore`. Schema per spec §6; query style
//! follows `agoranet/src/dag/service.rs` (`Arc<Pool<Postgres>>`, plain
//! `sqlx::query`/`query_as` rather than the `query!` macro, so the crate
//! doesn't need a live database or cached query metadata to build).
//! Writes retry with `backoff::future::retry`, mirroring
//! `wallet/crates/sync/src/lib.rs::submit_node_with_retry`.

use super::{ConsumeOutcome, StoreError, StoreResult, VerificationStore};
use crate::method::Method;
use crate::model::{AuditEvent, MethodCompletion, QrToken, VerificationAttempt, VerifierProfile};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Postgres-backed durable store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Arc<Pool<Postgres>>,
    write_backoff: ExponentialBackoff,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Transient(format!("failed to connect: {e}")))?;
        Ok(Self::from_pool(Arc::new(pool)))
    }

    pub fn from_pool(pool: Arc<Pool<Postgres>>) -> Self {
        let write_backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..ExponentialBackoff::default()
        };
        Self { pool, write_backoff }
    }

    /// Run a write `op` with exponential backoff; up to 5 attempts worth
    /// of elapsed time per §4.2's "writes are idempotent so retries are
    /// safe".
    async fn with_retry<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let backoff = self.write_backoff.clone();
        let attempt = || async {
            op().await.map_err(|e| {
                warn!("store write failed, retrying: {e}");
                backoff::Error::transient(StoreError::Transient(e.to_string()))
            })
        };
        backoff::future::retry(backoff, attempt)
            .await
            .map_err(|e| match e {
                backoff::Error::Permanent(inner) => inner,
                backoff::Error::Transient { err, .. } => err,
            })
    }
}

#[async_trait]
impl VerificationStore for PostgresStore {
    async fn upsert_completion(&self, completion: MethodCompletion) -> StoreResult<()> {
        let method_str = serde_json::to_string(&completion.method).unwrap();
        let metadata = serde_json::to_value(&completion.metadata).unwrap();
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO method_completions
                    (subject_id, method, completed_at, count, points_awarded, expires_at, metadata, source_verification_id, revoked)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (subject_id, method) DO UPDATE SET
                    completed_at = EXCLUDED.completed_at,
                    count = EXCLUDED.count,
                    points_awarded = EXCLUDED.points_awarded,
                    expires_at = EXCLUDED.expires_at,
                    metadata = EXCLUDED.metadata,
                    source_verification_id = EXCLUDED.source_verification_id,
                    revoked = EXCLUDED.revoked
                "#,
            )
            .bind(&completion.subject_id)
            .bind(&method_str)
            .bind(completion.completed_at)
            .bind(completion.count as i32)
            .bind(completion.points_awarded as i32)
            .bind(completion.expires_at)
            .bind(&metadata)
            .bind(&completion.source_verification_id)
            .bind(completion.revoked)
            .execute(self.pool.as_ref())
            .await
        })
        .await?;
        Ok(())
    }

    async fn retract_completion(&self, subject_id: &str, method: Method) -> StoreResult<()> {
        let method_str = serde_json::to_string(&method).unwrap();
        self.with_retry(|| async {
            sqlx::query("UPDATE method_completions SET revoked = true WHERE subject_id = $1 AND method = $2")
                .bind(subject_id)
                .bind(&method_str)
                .execute(self.pool.as_ref())
                .await
        })
        .await?;
        Ok(())
    }

    async fn get_completions(&self, subject_id: &str) -> StoreResult<Vec<MethodCompletion>> {
        let rows = sqlx::query("SELECT * FROM method_completions WHERE subject_id = $1")
            .bind(subject_id)
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        rows.into_iter().map(row_to_completion).collect()
    }

    async fn list_expiring_completions(&self, now: DateTime<Utc>) -> StoreResult<Vec<MethodCompletion>> {
        let rows = sqlx::query("SELECT * FROM method_completions WHERE NOT revoked AND expires_at IS NOT NULL AND expires_at < $1")
            .bind(now)
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        rows.into_iter().map(row_to_completion).collect()
    }

    async fn upsert_attempt(&self, attempt: VerificationAttempt) -> StoreResult<()> {
        let method_str = serde_json::to_string(&attempt.method).unwrap();
        let state_str = serde_json::to_string(&attempt.state).unwrap();
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO verification_attempts
                    (attempt_id, subject_id, method, state, created_at, deadline, saga_step, data)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (attempt_id) DO UPDATE SET
                    state = EXCLUDED.state,
                    saga_step = EXCLUDED.saga_step,
                    data = EXCLUDED.data
                "#,
            )
            .bind(&attempt.attempt_id)
            .bind(&attempt.subject_id)
            .bind(&method_str)
            .bind(&state_str)
            .bind(attempt.created_at)
            .bind(attempt.deadline)
            .bind(attempt.saga_step as i32)
            .bind(&attempt.data)
            .execute(self.pool.as_ref())
            .await
        })
        .await?;
        Ok(())
    }

    async fn get_attempt(&self, attempt_id: &str) -> StoreResult<Option<VerificationAttempt>> {
        let row = sqlx::query("SELECT * FROM verification_attempts WHERE attempt_id = $1")
            .bind(attempt_id)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        row.map(row_to_attempt).transpose()
    }

    async fn active_attempt_for_method(
        &self,
        subject_id: &str,
        method: Method,
    ) -> StoreResult<Option<VerificationAttempt>> {
        let method_str = serde_json::to_string(&method).unwrap();
        let row = sqlx::query(
            "SELECT * FROM verification_attempts WHERE subject_id = $1 AND method = $2 AND state NOT IN ('\"completed\"','\"rejected\"','\"expired\"','\"revoked\"') LIMIT 1",
        )
        .bind(subject_id)
        .bind(&method_str)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| StoreError::Transient(e.to_string()))?;
        row.map(row_to_attempt).transpose()
    }

    async fn issue_qr_tokens(&self, tokens: Vec<QrToken>) -> StoreResult<()> {
        for t in tokens {
            self.with_retry(|| async {
                sqlx::query(
                    r#"
                    INSERT INTO qr_tokens (token, attempt_id, slot, issued_at, expires_at, consumed_by, invalidated)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (token) DO NOTHING
                    "#,
                )
                .bind(&t.token)
                .bind(&t.attempt_id)
                .bind(t.slot as i16)
                .bind(t.issued_at)
                .bind(t.expires_at)
                .bind(&t.consumed_by)
                .bind(t.invalidated)
                .execute(self.pool.as_ref())
                .await
            })
            .await?;
        }
        Ok(())
    }

    async fn consume_qr_token(&self, token: &str, verifier: &str, now: DateTime<Utc>) -> StoreResult<ConsumeOutcome> {
        // Compare-and-set: only the first racer's UPDATE affects a row.
        let row = sqlx::query(
            r#"
            UPDATE qr_tokens
            SET consumed_by = $2
            WHERE token = $1 AND consumed_by IS NULL AND NOT invalidated AND expires_at > $3
            RETURNING token
            "#,
        )
        .bind(token)
        .bind(verifier)
        .bind(now)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| StoreError::Transient(e.to_string()))?;

        if row.is_some() {
            return Ok(ConsumeOutcome::Ok);
        }

        // Didn't win the CAS: figure out precisely why, for the caller to
        // distinguish same-verifier replay from a competing consumption.
        let existing = sqlx::query("SELECT consumed_by, invalidated, expires_at FROM qr_tokens WHERE token = $1")
            .bind(token)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        let Some(row) = existing else {
            return Ok(ConsumeOutcome::Invalid);
        };
        let invalidated: bool = row.try_get("invalidated").unwrap_or(true);
        let expires_at: DateTime<Utc> = row.try_get("expires_at").unwrap_or(now);
        let consumed_by: Option<String> = row.try_get("consumed_by").unwrap_or(None);

        if invalidated {
            return Ok(ConsumeOutcome::Invalid);
        }
        if expires_at <= now {
            return Ok(ConsumeOutcome::Expired);
        }
        match consumed_by {
            Some(v) if v == verifier => Ok(ConsumeOutcome::AlreadyConsumedBySame),
            Some(_) => Ok(ConsumeOutcome::AlreadyConsumedByOther),
            None => Ok(ConsumeOutcome::Invalid),
        }
    }

    async fn invalidate_qr_tokens(&self, attempt_id: &str) -> StoreResult<()> {
        self.with_retry(|| async {
            sqlx::query("UPDATE qr_tokens SET invalidated = true WHERE attempt_id = $1")
                .bind(attempt_id)
                .execute(self.pool.as_ref())
                .await
        })
        .await?;
        Ok(())
    }

    async fn get_qr_tokens(&self, attempt_id: &str) -> StoreResult<Vec<QrToken>> {
        let rows = sqlx::query("SELECT * FROM qr_tokens WHERE attempt_id = $1")
            .bind(attempt_id)
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        rows.into_iter().map(row_to_qr_token).collect()
    }

    async fn record_confirmation(
        &self,
        attempt_id: &str,
        slot: u8,
        verifier_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO verifier_confirmations (attempt_id, slot, verifier_id, confirmed_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (attempt_id, slot, verifier_id) DO NOTHING
                "#,
            )
            .bind(attempt_id)
            .bind(slot as i16)
            .bind(verifier_id)
            .bind(now)
            .execute(self.pool.as_ref())
            .await
        })
        .await?;
        Ok(())
    }

    async fn revoke_confirmations(&self, attempt_id: &str) -> StoreResult<()> {
        self.with_retry(|| async {
            sqlx::query("DELETE FROM verifier_confirmations WHERE attempt_id = $1")
                .bind(attempt_id)
                .execute(self.pool.as_ref())
                .await
        })
        .await?;
        Ok(())
    }

    async fn get_confirmations(&self, attempt_id: &str) -> StoreResult<Vec<(u8, String)>> {
        let rows = sqlx::query("SELECT slot, verifier_id FROM verifier_confirmations WHERE attempt_id = $1")
            .bind(attempt_id)
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let slot: i16 = r.try_get("slot").unwrap_or(0);
                let verifier_id: String = r.try_get("verifier_id").unwrap_or_default();
                (slot as u8, verifier_id)
            })
            .collect())
    }

    async fn get_verifier_profile(&self, principal_id: &str) -> StoreResult<Option<VerifierProfile>> {
        let row = sqlx::query("SELECT * FROM verifier_profiles WHERE principal_id = $1")
            .bind(principal_id)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        row.map(row_to_verifier_profile).transpose()
    }

    async fn upsert_verifier_profile(&self, profile: VerifierProfile) -> StoreResult<()> {
        let credentials = serde_json::to_value(&profile.credentials).unwrap();
        let own_level = serde_json::to_string(&profile.own_level).unwrap();
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO verifier_profiles
                    (principal_id, authorized, auto_qualified, credentials, attested_count,
                     rejection_count, rating, revoked, revoked_reason, last_credential_check_at, own_level)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (principal_id) DO UPDATE SET
                    authorized = EXCLUDED.authorized,
                    auto_qualified = EXCLUDED.auto_qualified,
                    credentials = EXCLUDED.credentials,
                    attested_count = EXCLUDED.attested_count,
                    rejection_count = EXCLUDED.rejection_count,
                    rating = EXCLUDED.rating,
                    revoked = EXCLUDED.revoked,
                    revoked_reason = EXCLUDED.revoked_reason,
                    last_credential_check_at = EXCLUDED.last_credential_check_at,
                    own_level = EXCLUDED.own_level
                "#,
            )
            .bind(&profile.principal_id)
            .bind(profile.authorized)
            .bind(profile.auto_qualified)
            .bind(&credentials)
            .bind(profile.attested_count as i32)
            .bind(profile.rejection_count as i32)
            .bind(profile.rating)
            .bind(profile.revoked)
            .bind(&profile.revoked_reason)
            .bind(profile.last_credential_check_at)
            .bind(&own_level)
            .execute(self.pool.as_ref())
            .await
        })
        .await?;
        Ok(())
    }

    async fn record_event(&self, event: AuditEvent) -> StoreResult<()> {
        let kind = serde_json::to_string(&event.kind).unwrap();
        let method = event.method.map(|m| serde_json::to_string(&m).unwrap());
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO audit_events
                    (event_id, subject_id, occurred_at, kind, method, attempt_id, actor_id, data, orchestrator_instance_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(&event.event_id)
            .bind(&event.subject_id)
            .bind(event.occurred_at)
            .bind(&kind)
            .bind(&method)
            .bind(&event.attempt_id)
            .bind(&event.actor_id)
            .bind(&event.data)
            .bind(&event.orchestrator_instance_id)
            .execute(self.pool.as_ref())
            .await
        })
        .await?;
        Ok(())
    }

    async fn list_events(&self, subject_id: &str) -> StoreResult<Vec<AuditEvent>> {
        let rows = sqlx::query("SELECT * FROM audit_events WHERE subject_id = $1 ORDER BY occurred_at ASC")
            .bind(subject_id)
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        rows.into_iter().map(row_to_event).collect()
    }

    async fn record_attestation(&self, subject_id: &str, method: Method, attestor_id: &str) -> StoreResult<u32> {
        let method_str = serde_json::to_string(&method).unwrap();
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO attestations (subject_id, method, attestor_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (subject_id, method, attestor_id) DO NOTHING
                "#,
            )
            .bind(subject_id)
            .bind(&method_str)
            .bind(attestor_id)
            .execute(self.pool.as_ref())
            .await
        })
        .await?;

        let row = sqlx::query("SELECT COUNT(DISTINCT attestor_id) AS n FROM attestations WHERE subject_id = $1 AND method = $2")
            .bind(subject_id)
            .bind(&method_str)
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        let n: i64 = row.try_get("n").unwrap_or(0);
        Ok(n as u32)
    }
}

fn row_to_completion(row: sqlx::postgres::PgRow) -> StoreResult<MethodCompletion> {
    let method_str: String = row.try_get("method").map_err(|e| StoreError::Transient(e.to_string()))?;
    let method: Method = serde_json::from_str(&method_str).map_err(|e| StoreError::Transient(e.to_string()))?;
    let metadata_json: serde_json::Value = row.try_get("metadata").unwrap_or(serde_json::Value::Null);
    let metadata = serde_json::from_value(metadata_json).unwrap_or_default();
    Ok(MethodCompletion {
        subject_id: row.try_get("subject_id").map_err(|e| StoreError::Transient(e.to_string()))?,
        method,
        completed_at: row.try_get("completed_at").map_err(|e| StoreError::Transient(e.to_string()))?,
        count: row.try_get::<i32, _>("count").map_err(|e| StoreError::Transient(e.to_string()))? as u32,
        points_awarded: row.try_get::<i32, _>("points_awarded").map_err(|e| StoreError::Transient(e.to_string()))? as u32,
        expires_at: row.try_get("expires_at").ok(),
        metadata,
        source_verification_id: row.try_get("source_verification_id").ok(),
        revoked: row.try_get("revoked").unwrap_or(false),
    })
}

fn row_to_attempt(row: sqlx::postgres::PgRow) -> StoreResult<VerificationAttempt> {
    let method_str: String = row.try_get("method").map_err(|e| StoreError::Transient(e.to_string()))?;
    let method: Method = serde_json::from_str(&method_str).map_err(|e| StoreError::Transient(e.to_string()))?;
    let state_str: String = row.try_get("state").map_err(|e| StoreError::Transient(e.to_string()))?;
    let state = serde_json::from_str(&state_str).map_err(|e| StoreError::Transient(e.to_string()))?;
    Ok(VerificationAttempt {
        attempt_id: row.try_get("attempt_id").map_err(|e| StoreError::Transient(e.to_string()))?,
        subject_id: row.try_get("subject_id").map_err(|e| StoreError::Transient(e.to_string()))?,
        method,
        state,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Transient(e.to_string()))?,
        deadline: row.try_get("deadline").map_err(|e| StoreError::Transient(e.to_string()))?,
        saga_step: row.try_get::<i32, _>("saga_step").map_err(|e| StoreError::Transient(e.to_string()))? as u32,
        data: row.try_get("data").unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_qr_token(row: sqlx::postgres::PgRow) -> StoreResult<QrToken> {
    Ok(QrToken {
        token: row.try_get("token").map_err(|e| StoreError::Transient(e.to_string()))?,
        attempt_id: row.try_get("attempt_id").map_err(|e| StoreError::Transient(e.to_string()))?,
        slot: row.try_get::<i16, _>("slot").map_err(|e| StoreError::Transient(e.to_string()))? as u8,
        issued_at: row.try_get("issued_at").map_err(|e| StoreError::Transient(e.to_string()))?,
        expires_at: row.try_get("expires_at").map_err(|e| StoreError::Transient(e.to_string()))?,
        consumed_by: row.try_get("consumed_by").ok(),
        invalidated: row.try_get("invalidated").unwrap_or(false),
    })
}

fn row_to_verifier_profile(row: sqlx::postgres::PgRow) -> StoreResult<VerifierProfile> {
    let credentials_json: serde_json::Value = row.try_get("credentials").unwrap_or(serde_json::Value::Null);
    let credentials = serde_json::from_value(credentials_json).unwrap_or_default();
    let own_level_str: String = row.try_get("own_level").unwrap_or_else(|_| "\"unverified\"".to_string());
    let own_level = serde_json::from_str(&own_level_str).unwrap_or(crate::scoring::Level::Unverified);
    Ok(VerifierProfile {
        principal_id: row.try_get("principal_id").map_err(|e| StoreError::Transient(e.to_string()))?,
        authorized: row.try_get("authorized").unwrap_or(false),
        auto_qualified: row.try_get("auto_qualified").unwrap_or(false),
        credentials,
        attested_count: row.try_get::<i32, _>("attested_count").unwrap_or(0) as u32,
        rejection_count: row.try_get::<i32, _>("rejection_count").unwrap_or(0) as u32,
        rating: row.try_get("rating").unwrap_or(0.0),
        revoked: row.try_get("revoked").unwrap_or(false),
        revoked_reason: row.try_get("revoked_reason").ok(),
        last_credential_check_at: row.try_get("last_credential_check_at").ok(),
        own_level,
    })
}

fn row_to_event(row: sqlx::postgres::PgRow) -> StoreResult<AuditEvent> {
    let kind_str: String = row.try_get("kind").map_err(|e| StoreError::Transient(e.to_string()))?;
    let kind = serde_json::from_str(&kind_str).map_err(|e| StoreError::Transient(e.to_string()))?;
    let method = row
        .try_get::<Option<String>, _>("method")
        .ok()
        .flatten()
        .and_then(|s| serde_json::from_str(&s).ok());
    Ok(AuditEvent {
        event_id: row.try_get("event_id").map_err(|e| StoreError::Transient(e.to_string()))?,
        subject_id: row.try_get("subject_id").map_err(|e| StoreError::Transient(e.to_string()))?,
        kind,
        actor_id: row.try_get("actor_id").ok(),
        method,
        attempt_id: row.try_get("attempt_id").ok(),
        data: row.try_get("data").unwrap_or(serde_json::Value::Null),
        occurred_at: row.try_get("occurred_at").map_err(|e| StoreError::Transient(e.to_string()))?,
        orchestrator_instance_id: row.try_get("orchestrator_instance_id").map_err(|e| StoreError::Transient(e.to_string()))?,
    })
}
