use crate::schema::job::{Job, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Compact job view sent to stream subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress: i32,
    pub processed_rows: i32,
    pub total_rows: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress: job.progress,
            processed_rows: job.processed_rows,
            total_rows: job.total_rows,
            error: job.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Initial {
        job_id: Uuid,
        data: JobSnapshot,
        timestamp: DateTime<Utc>,
    },
    Update {
        job_id: Uuid,
        data: JobSnapshot,
        timestamp: DateTime<Utc>,
    },
    Complete {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl StatusEvent {
    pub fn initial(job: &Job) -> Self {
        StatusEvent::Initial {
            job_id: job.id,
            data: job.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn update(job: &Job) -> Self {
        StatusEvent::Update {
            job_id: job.id,
            data: job.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn complete() -> Self {
        StatusEvent::Complete {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StatusEvent::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        StatusEvent::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::Initial { .. } => "initial",
            StatusEvent::Update { .. } => "update",
            StatusEvent::Complete { .. } => "complete",
            StatusEvent::Error { .. } => "error",
            StatusEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}
