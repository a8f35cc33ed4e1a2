use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// One unit of work within a job. `index` is the stable resume key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRow {
    pub index: i32,
    pub input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowResult {
    pub index: i32,
    pub input: String,
    pub output: String,
    pub tokens: i64,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    pub provider: String,
    pub model: String,
    pub credential_enc: String,
    pub template: Option<String>,
    pub task_type: Option<String>,
    pub input_data: Json<Vec<InputRow>>,
    pub results: Json<Vec<RowResult>>,
    pub progress: i32,
    pub processed_rows: i32,
    pub total_rows: i32,
    pub retry_count: i32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Rows that do not yet have a results entry, in stable index order.
    pub fn pending_rows(&self) -> Vec<InputRow> {
        let done: HashSet<i32> = self.results.iter().map(|r| r.index).collect();
        self.input_data
            .iter()
            .filter(|row| !done.contains(&row.index))
            .cloned()
            .collect()
    }
}

pub fn progress_pct(processed_rows: i32, total_rows: i32) -> i32 {
    if total_rows <= 0 {
        return 100;
    }
    ((processed_rows as f64 * 100.0) / total_rows as f64).round() as i32
}
