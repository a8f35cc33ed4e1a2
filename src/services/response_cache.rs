use crate::schema::CacheEntry;
use anyhow::Result;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

const KEY_SEPARATOR: &str = "\u{1f}";
const DEFAULT_TTL_HOURS: i64 = 24;

/// Longer-lived entries for the expensive models; anything unlisted gets
/// the default. Matched by substring against the normalized model id.
const MODEL_TTL_HOURS: &[(&str, i64)] = &[
    ("opus", 72),
    ("gpt-5", 72),
    ("sonnet", 48),
    ("gpt-4", 48),
    ("o3", 48),
    ("haiku", 12),
    ("mini", 12),
];

pub fn ttl_for_model(model: &str) -> Duration {
    let model = model.trim().to_lowercase();
    let hours = MODEL_TTL_HOURS
        .iter()
        .find(|(needle, _)| model.contains(needle))
        .map(|(_, hours)| *hours)
        .unwrap_or(DEFAULT_TTL_HOURS);
    Duration::hours(hours)
}

/// Content-addressed key over (model, instructions, user content).
/// Incidental whitespace and model/instruction casing do not change it.
pub fn cache_key(model: &str, instructions: &str, content: &str) -> String {
    let model = model.trim().to_lowercase();
    let instructions = instructions.trim().to_lowercase();
    let content = content.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(KEY_SEPARATOR.as_bytes());
    hasher.update(instructions.as_bytes());
    hasher.update(KEY_SEPARATOR.as_bytes());
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: String,
    pub tokens_used: i64,
}

/// Best-effort memoization of model responses. Nothing here may fail the
/// caller: lookup errors read as misses and write errors are swallowed.
#[async_trait::async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheHit>;
    async fn put(&self, key: &str, model: &str, response: &str, tokens_used: i64);
    async fn sweep(&self) -> Result<u64>;
}

pub struct PgResponseCache {
    pool: PgPool,
}

impl PgResponseCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ResponseCache for PgResponseCache {
    async fn get(&self, key: &str) -> Option<CacheHit> {
        let entry = match sqlx::query_as::<_, CacheEntry>(
            "SELECT key, model, response, tokens_used, hit_count, last_hit_at, created_at, expires_at
             FROM response_cache WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "cache lookup failed");
                return None;
            }
        };

        if entry.is_expired(Utc::now()) {
            if let Err(e) = sqlx::query("DELETE FROM response_cache WHERE key = $1")
                .bind(key)
                .execute(&self.pool)
                .await
            {
                tracing::warn!(error = %e, "failed to delete expired cache entry");
            }
            return None;
        }

        // hit bookkeeping must never delay the caller
        let pool = self.pool.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = sqlx::query(
                "UPDATE response_cache SET hit_count = hit_count + 1, last_hit_at = now()
                 WHERE key = $1",
            )
            .bind(&key)
            .execute(&pool)
            .await
            {
                tracing::warn!(error = %e, "failed to record cache hit");
            }
        });

        Some(CacheHit {
            response: entry.response,
            tokens_used: entry.tokens_used,
        })
    }

    async fn put(&self, key: &str, model: &str, response: &str, tokens_used: i64) {
        let expires_at = Utc::now() + ttl_for_model(model);
        let result = sqlx::query(
            "INSERT INTO response_cache (key, model, response, tokens_used, expires_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (key) DO UPDATE
                 SET response = EXCLUDED.response,
                     tokens_used = EXCLUDED.tokens_used,
                     expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(model)
        .bind(response)
        .bind(tokens_used)
        .bind(expires_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "cache write failed");
        }
    }

    async fn sweep(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM response_cache WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
