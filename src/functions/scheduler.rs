use crate::functions::executor::{self, ExecutorConfig, RunOutcome, WorkerDeps};
use crate::services::ResponseCache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running jobs per tick.
    pub max_jobs: i64,
    /// Claims older than this are considered abandoned.
    pub stale_after: Duration,
    /// Stale jobs past this many requeues are left quarantined for an
    /// operator instead of looping forever.
    pub max_retries: i32,
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jobs: 5,
            stale_after: Duration::from_secs(300),
            max_retries: 3,
            tick_interval: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_jobs: env_parse("VOLLEY_MAX_CONCURRENT_JOBS", defaults.max_jobs),
            stale_after: Duration::from_secs(env_parse(
                "VOLLEY_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )),
            max_retries: env_parse("VOLLEY_MAX_RETRIES", defaults.max_retries),
            tick_interval: Duration::from_secs(env_parse(
                "VOLLEY_TICK_INTERVAL_SECS",
                defaults.tick_interval.as_secs(),
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub jobs_processed: u32,
    pub completed: u32,
    pub failed: u32,
    pub total_rows_processed: i64,
    pub total_tokens: i64,
    pub stale_jobs_reset: u64,
    pub elapsed_ms: u64,
}

/// One scheduler pass: requeue stale claims, claim a bounded set of
/// queued jobs, and run one executor per claim. Executors fail
/// independently; the tick always returns a summary.
pub async fn worker_tick(
    deps: &WorkerDeps,
    exec_cfg: ExecutorConfig,
    cfg: &SchedulerConfig,
) -> TickSummary {
    let started = Instant::now();
    let mut summary = TickSummary::default();

    match deps.store.reset_stale(cfg.stale_after, cfg.max_retries).await {
        Ok(count) => {
            summary.stale_jobs_reset = count;
            if count > 0 {
                tracing::warn!(count, "requeued stale jobs");
            }
        }
        Err(e) => tracing::error!(error = %e, "stale recovery failed"),
    }

    let claimed = match deps.store.claim_batch(cfg.max_jobs).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(error = %e, "bulk claim unavailable, claiming one at a time");
            let mut ids = Vec::new();
            while (ids.len() as i64) < cfg.max_jobs {
                match deps.store.claim_next().await {
                    Ok(Some(id)) => ids.push(id),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "single claim failed");
                        break;
                    }
                }
            }
            ids
        }
    };

    let mut handles = Vec::with_capacity(claimed.len());
    for id in claimed {
        let deps = deps.clone();
        handles.push(tokio::spawn(executor::run_job(id, deps, exec_cfg)));
    }

    for handle in handles {
        match handle.await {
            Ok(report) => {
                summary.jobs_processed += 1;
                summary.total_rows_processed += report.rows_processed;
                summary.total_tokens += report.total_tokens;
                match report.outcome {
                    RunOutcome::Completed => summary.completed += 1,
                    RunOutcome::Failed => summary.failed += 1,
                    RunOutcome::Cancelled => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "executor task aborted");
                summary.jobs_processed += 1;
                summary.failed += 1;
            }
        }
    }

    summary.elapsed_ms = started.elapsed().as_millis() as u64;
    if summary.jobs_processed > 0 || summary.stale_jobs_reset > 0 {
        tracing::info!(
            jobs = summary.jobs_processed,
            completed = summary.completed,
            failed = summary.failed,
            rows = summary.total_rows_processed,
            tokens = summary.total_tokens,
            stale_reset = summary.stale_jobs_reset,
            elapsed_ms = summary.elapsed_ms,
            "worker tick finished"
        );
    } else {
        tracing::debug!("worker tick idle");
    }
    summary
}

pub async fn run(
    deps: WorkerDeps,
    exec_cfg: ExecutorConfig,
    cfg: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(cfg.tick_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                worker_tick(&deps, exec_cfg, &cfg).await;
            }
        }
    }
    tracing::info!("worker scheduler stopped");
}

pub async fn run_cache_sweep(cache: Arc<dyn ResponseCache>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(CACHE_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                match cache.sweep().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "swept expired cache entries"),
                    Err(e) => tracing::warn!(error = %e, "cache sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::JobStatus;
    use crate::services::CredentialCipher;
    use crate::services::invoker::stub::{StubInvoker, StubResolver};
    use crate::services::job_store::memory::{MemoryJobStore, make_job};
    use crate::services::response_cache::memory::MemoryResponseCache;
    use chrono::Utc;
    use uuid::Uuid;

    fn deps(store: Arc<MemoryJobStore>, invoker: Arc<StubInvoker>) -> WorkerDeps {
        WorkerDeps {
            store,
            cache: Arc::new(MemoryResponseCache::new()),
            cipher: Arc::new(CredentialCipher::new("test-secret")),
            resolver: Arc::new(StubResolver { invoker }),
        }
    }

    fn cfg() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    fn exec_cfg() -> ExecutorConfig {
        ExecutorConfig { batch_size: 12 }
    }

    fn seed_queued(store: &MemoryJobStore, cipher: &CredentialCipher, inputs: &[&str]) -> Uuid {
        let mut job = make_job(Uuid::new_v4(), JobStatus::Queued, inputs);
        job.credential_enc = cipher.encrypt("sk-test").unwrap();
        store.seed(job)
    }

    #[tokio::test]
    async fn tick_drains_the_queue_up_to_the_limit() {
        let store = Arc::new(MemoryJobStore::new());
        let invoker = StubInvoker::echoing();
        let deps = deps(store.clone(), invoker);
        for _ in 0..7 {
            seed_queued(&store, &deps.cipher, &["a", "b", "c"]);
        }

        let summary = worker_tick(&deps, exec_cfg(), &cfg()).await;

        assert_eq!(summary.jobs_processed, 5);
        assert_eq!(summary.completed, 5);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.total_rows_processed, 15);
        assert!(summary.total_tokens > 0);

        let second = worker_tick(&deps, exec_cfg(), &cfg()).await;
        assert_eq!(second.jobs_processed, 2, "remainder claimed next tick");
    }

    #[tokio::test]
    async fn idle_tick_reports_nothing() {
        let store = Arc::new(MemoryJobStore::new());
        let deps = deps(store, StubInvoker::echoing());

        let summary = worker_tick(&deps, exec_cfg(), &cfg()).await;

        assert_eq!(summary.jobs_processed, 0);
        assert_eq!(summary.stale_jobs_reset, 0);
    }

    #[tokio::test]
    async fn stale_claim_is_requeued_and_picked_up_again() {
        let store = Arc::new(MemoryJobStore::new());
        let invoker = StubInvoker::echoing();
        let deps = deps(store.clone(), invoker);

        let mut job = make_job(Uuid::new_v4(), JobStatus::Processing, &["a"]);
        job.credential_enc = deps.cipher.encrypt("sk-test").unwrap();
        job.started_at = Some(Utc::now() - chrono::Duration::minutes(10));
        job.retry_count = 1;
        let id = store.seed(job);

        let summary = worker_tick(&deps, exec_cfg(), &cfg()).await;

        assert_eq!(summary.stale_jobs_reset, 1);
        assert_eq!(summary.completed, 1);

        let job = store.get(id);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 2);
    }

    #[tokio::test]
    async fn quarantined_job_is_left_alone() {
        let store = Arc::new(MemoryJobStore::new());
        let invoker = StubInvoker::echoing();
        let deps = deps(store.clone(), invoker.clone());

        let mut job = make_job(Uuid::new_v4(), JobStatus::Processing, &["a"]);
        job.credential_enc = deps.cipher.encrypt("sk-test").unwrap();
        job.started_at = Some(Utc::now() - chrono::Duration::hours(1));
        job.retry_count = 3;
        let id = store.seed(job);

        let summary = worker_tick(&deps, exec_cfg(), &cfg()).await;

        assert_eq!(summary.stale_jobs_reset, 0);
        assert_eq!(summary.jobs_processed, 0);
        assert_eq!(invoker.call_count(), 0);
        assert_eq!(store.get(id).status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn falls_back_to_single_claims() {
        let store = Arc::new(MemoryJobStore::new());
        store.disable_bulk_claims();
        let invoker = StubInvoker::echoing();
        let deps = deps(store.clone(), invoker);
        for _ in 0..3 {
            seed_queued(&store, &deps.cipher, &["a"]);
        }

        let summary = worker_tick(&deps, exec_cfg(), &cfg()).await;

        assert_eq!(summary.jobs_processed, 3);
        assert_eq!(summary.completed, 3);
    }

    #[tokio::test]
    async fn one_failing_job_does_not_block_the_others() {
        let store = Arc::new(MemoryJobStore::new());
        let invoker = StubInvoker::echoing();
        let deps = deps(store.clone(), invoker);

        let good = seed_queued(&store, &deps.cipher, &["a", "b"]);
        let mut bad = make_job(Uuid::new_v4(), JobStatus::Queued, &["x"]);
        bad.credential_enc = "garbage".to_string();
        let bad = store.seed(bad);

        let summary = worker_tick(&deps, exec_cfg(), &cfg()).await;

        assert_eq!(summary.jobs_processed, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(store.get(good).status, JobStatus::Completed);
        assert_eq!(store.get(bad).status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn overlapping_ticks_never_run_a_job_twice() {
        let store = Arc::new(MemoryJobStore::new());
        let invoker = StubInvoker::echoing();
        let deps_a = deps(store.clone(), invoker.clone());
        let deps_b = WorkerDeps {
            store: store.clone(),
            ..deps_a.clone()
        };
        let id = seed_queued(&store, &deps_a.cipher, &["a", "b"]);

        let cfg_a = cfg();
        let cfg_b = cfg();
        let (a, b) = tokio::join!(
            worker_tick(&deps_a, exec_cfg(), &cfg_a),
            worker_tick(&deps_b, exec_cfg(), &cfg_b),
        );

        assert_eq!(a.jobs_processed + b.jobs_processed, 1);
        assert_eq!(invoker.call_count(), 1, "single batch call in total");
        assert_eq!(store.get(id).status, JobStatus::Completed);
    }
}
