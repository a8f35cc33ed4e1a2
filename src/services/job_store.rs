use crate::schema::{InputRow, Job, JobStatus, RowResult};
use anyhow::Result;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use std::collections::HashSet;
use tokio::sync::mpsc;
use uuid::Uuid;

const NOTIFY_CHANNEL: &str = "volley_jobs";

#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: Uuid,
    pub provider: String,
    pub model: String,
    pub credential_enc: String,
    pub template: Option<String>,
    pub task_type: Option<String>,
    pub input_data: Vec<InputRow>,
}

/// The durable job table, behind a seam so the worker logic can run
/// against a fake that simulates claim atomicity. The store owns every
/// concurrency guarantee: claims are atomic read-and-flip operations,
/// never read-then-write from this side.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, new: NewJob) -> Result<Uuid>;
    async fn fetch(&self, id: Uuid) -> Result<Option<Job>>;
    async fn fetch_status(&self, id: Uuid) -> Result<Option<JobStatus>>;

    /// Atomically flip one queued job to processing. Returns its id.
    async fn claim_next(&self) -> Result<Option<Uuid>>;

    /// Atomically flip up to `limit` queued jobs to processing.
    async fn claim_batch(&self, limit: i64) -> Result<Vec<Uuid>>;

    /// Append results and advance the resume point. Conditional on the
    /// row still being in processing; returns false when the write was
    /// refused (e.g. the job was cancelled underneath the worker).
    async fn checkpoint(
        &self,
        id: Uuid,
        new_results: &[RowResult],
        processed_rows: i32,
        progress: i32,
    ) -> Result<bool>;

    /// Conditional processing -> completed transition.
    async fn complete(&self, id: Uuid) -> Result<bool>;

    /// Terminal failure; checkpointed partial results are preserved.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Conditional cancellation of a queued or processing job.
    async fn cancel(&self, id: Uuid) -> Result<bool>;

    /// Requeue processing jobs whose claim went stale, bounded by the
    /// retry ceiling. Jobs at the ceiling are left untouched.
    async fn reset_stale(&self, older_than: std::time::Duration, max_retries: i32) -> Result<u64>;

    async fn record_usage(
        &self,
        job_id: Uuid,
        rows_processed: i32,
        total_tokens: i64,
        cost_estimate: f64,
    ) -> Result<()>;

    /// Change notifications scoped to the given job ids. The feed ends
    /// when the receiver is dropped.
    async fn changes(&self, ids: &[Uuid]) -> Result<mpsc::UnboundedReceiver<Uuid>>;
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, new: NewJob) -> Result<Uuid> {
        let total_rows = new.input_data.len() as i32;
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO jobs (user_id, provider, model, credential_enc, template, task_type, input_data, total_rows)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(new.user_id)
        .bind(&new.provider)
        .bind(&new.model)
        .bind(&new.credential_enc)
        .bind(&new.template)
        .bind(&new.task_type)
        .bind(Json(&new.input_data))
        .bind(total_rows)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn fetch_status(&self, id: Uuid) -> Result<Option<JobStatus>> {
        let status = sqlx::query_scalar::<_, JobStatus>("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }

    async fn claim_next(&self) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = now(), updated_at = now()
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued'
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim_batch(&self, limit: i64) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = now(), updated_at = now()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'queued'
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn checkpoint(
        &self,
        id: Uuid,
        new_results: &[RowResult],
        processed_rows: i32,
        progress: i32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET results = results || $2::jsonb,
                processed_rows = $3,
                progress = $4,
                updated_at = now()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(Json(new_results))
        .bind(processed_rows)
        .bind(progress)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', progress = 100, completed_at = now(), updated_at = now()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error = $2, completed_at = now(), updated_at = now()
            WHERE id = $1 AND status IN ('queued', 'processing')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = now(), updated_at = now()
            WHERE id = $1 AND status IN ('queued', 'processing')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_stale(&self, older_than: std::time::Duration, max_retries: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', started_at = NULL, retry_count = retry_count + 1, updated_at = now()
            WHERE status = 'processing'
              AND started_at < now() - make_interval(secs => $1)
              AND retry_count < $2
            "#,
        )
        .bind(older_than.as_secs_f64())
        .bind(max_retries)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_usage(
        &self,
        job_id: Uuid,
        rows_processed: i32,
        total_tokens: i64,
        cost_estimate: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_events (job_id, rows_processed, total_tokens, cost_estimate)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job_id)
        .bind(rows_processed)
        .bind(total_tokens)
        .bind(cost_estimate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn changes(&self, ids: &[Uuid]) -> Result<mpsc::UnboundedReceiver<Uuid>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        let watched: HashSet<Uuid> = ids.iter().copied().collect();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Ok(id) = notification.payload().parse::<Uuid>() else {
                            continue;
                        };
                        if watched.contains(&id) && tx.send(id).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "job change listener dropped");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}
