// llmlb — tamper-evident audit log
//
// Append-only chain over administrative actions. Each entry hashes its own
// fields together with the previous entry's hash; verification replays the
// chain from genesis (or a checkpoint) and reports the first broken seq.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Closed action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    EndpointCreated,
    EndpointUpdated,
    EndpointDeleted,
    EndpointTested,
    EndpointSynced,
    UserCreated,
    UserUpdated,
    UserDeleted,
    UserPasswordChanged,
    ApiKeyCreated,
    ApiKeyUpdated,
    ApiKeyDeleted,
    InvitationCreated,
    InvitationConsumed,
    SystemUpdateApplied,
    SystemRollback,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::EndpointCreated => "endpoint.created",
            AuditAction::EndpointUpdated => "endpoint.updated",
            AuditAction::EndpointDeleted => "endpoint.deleted",
            AuditAction::EndpointTested => "endpoint.tested",
            AuditAction::EndpointSynced => "endpoint.synced",
            AuditAction::UserCreated => "user.created",
            AuditAction::UserUpdated => "user.updated",
            AuditAction::UserDeleted => "user.deleted",
            AuditAction::UserPasswordChanged => "user.password_changed",
            AuditAction::ApiKeyCreated => "api_key.created",
            AuditAction::ApiKeyUpdated => "api_key.updated",
            AuditAction::ApiKeyDeleted => "api_key.deleted",
            AuditAction::InvitationCreated => "invitation.created",
            AuditAction::InvitationConsumed => "invitation.consumed",
            AuditAction::SystemUpdateApplied => "system.update_applied",
            AuditAction::SystemRollback => "system.rollback",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub seq: i64,
    pub ts: String,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub payload_digest: String,
    pub prev_hash: String,
    pub this_hash: String,
}

#[derive(Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum VerifyResult {
    Ok { entries: i64 },
    BreakAt { seq: i64 },
}

#[derive(Clone)]
pub struct AuditLog {
    db: SqlitePool,
}

impl AuditLog {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Append one entry. seq assignment and the insert happen in a single
    /// transaction so commit order equals seq order.
    pub async fn append(
        &self,
        actor: &str,
        action: AuditAction,
        target: &str,
        payload: &Value,
    ) -> Result<AuditEntry, sqlx::Error> {
        let mut tx = self.db.begin().await?;

        let last: Option<(i64, String)> =
            sqlx::query_as("SELECT seq, this_hash FROM audit_log ORDER BY seq DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;
        let (seq, prev_hash) = match last {
            Some((seq, hash)) => (seq + 1, hash),
            None => (1, GENESIS_HASH.to_string()),
        };

        let entry = AuditEntry {
            seq,
            ts: Utc::now().to_rfc3339(),
            actor: actor.to_string(),
            action: action.as_str().to_string(),
            target: target.to_string(),
            payload_digest: digest(payload),
            prev_hash,
            this_hash: String::new(),
        };
        let this_hash = chain_hash(&entry);

        sqlx::query(
            "INSERT INTO audit_log (seq, ts, actor, action, target, payload_digest, prev_hash, this_hash) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.seq)
        .bind(&entry.ts)
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.target)
        .bind(&entry.payload_digest)
        .bind(&entry.prev_hash)
        .bind(&this_hash)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(AuditEntry { this_hash, ..entry })
    }

    /// Convenience wrapper for handlers: auditing must never fail the
    /// request that triggered it.
    pub async fn record(&self, actor: &str, action: AuditAction, target: &str, payload: Value) {
        if let Err(e) = self.append(actor, action, target, &payload).await {
            tracing::warn!(action = action.as_str(), "audit append failed: {e}");
        }
    }

    /// Re-hash the chain starting at `from_seq` (1 = genesis).
    pub async fn verify(&self, from_seq: i64) -> Result<VerifyResult, sqlx::Error> {
        let entries: Vec<AuditEntry> =
            sqlx::query_as("SELECT * FROM audit_log WHERE seq >= ? ORDER BY seq ASC")
                .bind(from_seq.max(1))
                .fetch_all(&self.db)
                .await?;

        let mut expected_prev: Option<String> = if from_seq <= 1 {
            Some(GENESIS_HASH.to_string())
        } else {
            sqlx::query_scalar("SELECT this_hash FROM audit_log WHERE seq = ?")
                .bind(from_seq - 1)
                .fetch_optional(&self.db)
                .await?
        };

        let mut expected_seq = from_seq.max(1);
        for entry in &entries {
            let prev_ok = expected_prev
                .as_deref()
                .is_none_or(|p| p == entry.prev_hash);
            if entry.seq != expected_seq || !prev_ok || chain_hash(entry) != entry.this_hash {
                return Ok(VerifyResult::BreakAt { seq: entry.seq });
            }
            expected_prev = Some(entry.this_hash.clone());
            expected_seq += 1;
        }
        Ok(VerifyResult::Ok {
            entries: entries.len() as i64,
        })
    }

    pub async fn list(&self, offset: i64, limit: i64) -> Result<Vec<AuditEntry>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM audit_log ORDER BY seq DESC LIMIT ? OFFSET ?")
            .bind(limit.clamp(1, 500))
            .bind(offset.max(0))
            .fetch_all(&self.db)
            .await
    }
}

fn digest(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}

/// this_hash = H(seq || ts || actor || action || target || digest || prev_hash)
fn chain_hash(entry: &AuditEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.ts.as_bytes());
    hasher.update(entry.actor.as_bytes());
    hasher.update(entry.action.as_bytes());
    hasher.update(entry.target.as_bytes());
    hasher.update(entry.payload_digest.as_bytes());
    hasher.update(entry.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}
