use crate::functions::batch::{self, BatchContext, DEFAULT_BATCH_SIZE};
use crate::schema::{Job, JobStatus, progress_pct};
use crate::services::{CredentialCipher, InvokerResolver, JobStore, ResponseCache};
use anyhow::Result;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_INSTRUCTIONS: &str = "You will receive a numbered list of inputs. \
Process every item and respond with a numbered list using the same numbers, \
one result per item. Do not skip numbers, merge items, or add commentary.";

fn instructions_for(task_type: Option<&str>) -> &'static str {
    match task_type {
        Some("summarize") => {
            "You will receive a numbered list of texts. Summarize each one in \
             one or two sentences and respond with a numbered list using the \
             same numbers. Do not skip numbers or merge items."
        }
        Some("classify") => {
            "You will receive a numbered list of texts. Assign each one a short \
             category label and respond with a numbered list using the same \
             numbers, one label per item."
        }
        Some("extract") => {
            "You will receive a numbered list of texts. Extract the key facts \
             from each one and respond with a numbered list using the same \
             numbers, one line of facts per item."
        }
        _ => DEFAULT_INSTRUCTIONS,
    }
}

const MODEL_COST_PER_1K: &[(&str, f64)] = &[
    ("opus", 0.075),
    ("gpt-5", 0.06),
    ("gpt-4", 0.03),
    ("sonnet", 0.018),
    ("haiku", 0.004),
    ("mini", 0.002),
];
const DEFAULT_COST_PER_1K: f64 = 0.01;

fn estimate_cost(model: &str, total_tokens: i64) -> f64 {
    let model = model.trim().to_lowercase();
    let rate = MODEL_COST_PER_1K
        .iter()
        .find(|(needle, _)| model.contains(needle))
        .map(|(_, rate)| *rate)
        .unwrap_or(DEFAULT_COST_PER_1K);
    rate * total_tokens as f64 / 1000.0
}

/// Shared handles every worker needs, cheap to clone per spawned job.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub cache: Arc<dyn ResponseCache>,
    pub cipher: Arc<CredentialCipher>,
    pub resolver: Arc<dyn InvokerResolver>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub batch_size: usize,
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let batch_size = std::env::var("VOLLEY_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        Self { batch_size }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobRunReport {
    pub job_id: Uuid,
    pub outcome: RunOutcome,
    pub rows_processed: i64,
    pub total_tokens: i64,
}

#[derive(Default)]
struct RunTotals {
    rows: i64,
    tokens: i64,
}

/// Full lifecycle of one claimed job. Never panics outward: any error is
/// turned into a failed status on the row, with already-checkpointed
/// results left intact.
pub async fn run_job(job_id: Uuid, deps: WorkerDeps, config: ExecutorConfig) -> JobRunReport {
    let mut totals = RunTotals::default();

    let outcome = match drive(job_id, &deps, config, &mut totals).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "job run failed");
            if let Err(e) = deps.store.mark_failed(job_id, &e.to_string()).await {
                tracing::error!(job_id = %job_id, error = %e, "failed to record job failure");
            }
            RunOutcome::Failed
        }
    };

    JobRunReport {
        job_id,
        outcome,
        rows_processed: totals.rows,
        total_tokens: totals.tokens,
    }
}

async fn drive(
    job_id: Uuid,
    deps: &WorkerDeps,
    config: ExecutorConfig,
    totals: &mut RunTotals,
) -> Result<RunOutcome> {
    let job = deps
        .store
        .fetch(job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;

    let api_key = deps
        .cipher
        .decrypt(&job.credential_enc)
        .map_err(|e| anyhow::anyhow!("credential decryption failed: {e}"))?;

    let invoker = deps
        .resolver
        .resolve(&job.provider, &job.model, api_key)
        .map_err(|e| anyhow::anyhow!("no usable model invoker: {e}"))?;

    let cx = BatchContext {
        invoker,
        cache: deps.cache.clone(),
        model: job.model.clone(),
        instructions: batch::fold_template(
            instructions_for(job.task_type.as_deref()),
            job.template.as_deref(),
        ),
    };

    let pending = job.pending_rows();
    tracing::info!(
        job_id = %job_id,
        pending = pending.len(),
        resumed_from = job.processed_rows,
        "running job"
    );

    let mut processed = job.processed_rows;

    for chunk in pending.chunks(config.batch_size) {
        let status = deps
            .store
            .fetch_status(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {job_id} row disappeared"))?;
        if status == JobStatus::Cancelled {
            tracing::info!(job_id = %job_id, processed, "job cancelled, stopping");
            return Ok(RunOutcome::Cancelled);
        }

        let results = batch::process_chunk(chunk, &cx).await;

        totals.rows += results.len() as i64;
        totals.tokens += results.iter().map(|r| r.tokens).sum::<i64>();
        processed += results.len() as i32;
        let progress = progress_pct(processed, job.total_rows);

        let wrote = deps
            .store
            .checkpoint(job_id, &results, processed, progress)
            .await?;
        if !wrote {
            tracing::info!(job_id = %job_id, "checkpoint refused, job no longer processing");
            return Ok(RunOutcome::Cancelled);
        }
    }

    if !deps.store.complete(job_id).await? {
        return Ok(RunOutcome::Cancelled);
    }

    emit_usage(deps, &job, processed, totals.tokens);
    tracing::info!(
        job_id = %job_id,
        rows = processed,
        tokens = totals.tokens,
        "job completed"
    );
    Ok(RunOutcome::Completed)
}

/// Billing reconciliation is a downstream consumer; its write must never
/// stall or fail the run.
fn emit_usage(deps: &WorkerDeps, job: &Job, rows: i32, tokens: i64) {
    let store = deps.store.clone();
    let job_id = job.id;
    let cost = estimate_cost(&job.model, tokens);
    tokio::spawn(async move {
        if let Err(e) = store.record_usage(job_id, rows, tokens, cost).await {
            tracing::warn!(job_id = %job_id, error = %e, "failed to record usage");
        }
    });
}
