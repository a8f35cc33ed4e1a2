use crate::functions::api::{AppState, user_id_from_headers};
use crate::schema::StatusEvent;
use crate::services::JobStore;
use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Rapid checkpoint writes to the same job coalesce into one visible
/// update per window, carrying the freshest snapshot.
pub const UPDATE_DEBOUNCE: Duration = Duration::from_millis(500);
/// Keeps idle streams alive through intermediary timeouts.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(serde::Deserialize)]
pub struct StreamParams {
    /// Comma-separated job ids.
    pub ids: String,
}

pub async fn stream_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, axum::Error>>>, StatusCode> {
    let user_id = user_id_from_headers(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let job_ids = parse_ids(&params.ids).map_err(|_| StatusCode::BAD_REQUEST)?;
    if job_ids.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(publish_status(state.store.clone(), user_id, job_ids, tx));

    let stream = ReceiverStream::new(rx)
        .map(|event| Event::default().event(event.name()).json_data(&event));
    Ok(Sse::new(stream))
}

fn parse_ids(raw: &str) -> Result<Vec<Uuid>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| Ok(part.parse::<Uuid>()?))
        .collect()
}

/// Drives one subscriber channel until every watched job is terminal or
/// the subscriber goes away. Dropping the receiver tears everything
/// down: sends start failing and the change subscription is dropped
/// with this task.
pub async fn publish_status(
    store: Arc<dyn JobStore>,
    user_id: Uuid,
    job_ids: Vec<Uuid>,
    tx: mpsc::Sender<StatusEvent>,
) {
    if let Err(e) = publish(&store, user_id, &job_ids, &tx).await {
        tracing::warn!(user_id = %user_id, error = %e, "status stream ended with error");
        let _ = tx.send(StatusEvent::error(e.to_string())).await;
    }
}

async fn publish(
    store: &Arc<dyn JobStore>,
    user_id: Uuid,
    job_ids: &[Uuid],
    tx: &mpsc::Sender<StatusEvent>,
) -> Result<()> {
    let mut watched: Vec<Uuid> = Vec::new();
    let mut terminal: HashSet<Uuid> = HashSet::new();

    for id in job_ids {
        match store.fetch(*id).await? {
            Some(job) if job.user_id == user_id => {
                if tx.send(StatusEvent::initial(&job)).await.is_err() {
                    return Ok(());
                }
                if job.status.is_terminal() {
                    terminal.insert(job.id);
                }
                watched.push(job.id);
            }
            _ => {
                tracing::warn!(job_id = %id, user_id = %user_id, "stream request for unknown or foreign job");
            }
        }
    }

    if watched.is_empty() {
        anyhow::bail!("no accessible jobs in request");
    }
    if terminal.len() == watched.len() {
        let _ = tx.send(StatusEvent::complete()).await;
        return Ok(());
    }

    let mut changes = store.changes(&watched).await?;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // the immediate tick is not a heartbeat

    // job id -> first unflushed change; flushed UPDATE_DEBOUNCE later
    let mut pending: HashMap<Uuid, Instant> = HashMap::new();

    loop {
        let next_flush = pending.values().min().map(|t| *t + UPDATE_DEBOUNCE);

        tokio::select! {
            changed = changes.recv() => {
                let Some(id) = changed else {
                    anyhow::bail!("change feed closed");
                };
                if !terminal.contains(&id) {
                    pending.entry(id).or_insert_with(Instant::now);
                }
            }
            _ = tokio::time::sleep_until(next_flush.unwrap_or_else(Instant::now)), if next_flush.is_some() => {
                let now = Instant::now();
                let due: Vec<Uuid> = pending
                    .iter()
                    .filter(|(_, since)| **since + UPDATE_DEBOUNCE <= now)
                    .map(|(id, _)| *id)
                    .collect();

                for id in due {
                    pending.remove(&id);
                    let Some(job) = store.fetch(id).await? else {
                        continue;
                    };
                    if tx.send(StatusEvent::update(&job)).await.is_err() {
                        return Ok(());
                    }
                    if job.status.is_terminal() {
                        terminal.insert(id);
                    }
                }

                if terminal.len() == watched.len() {
                    let _ = tx.send(StatusEvent::complete()).await;
                    return Ok(());
                }
            }
            _ = heartbeat.tick() => {
                if tx.send(StatusEvent::heartbeat()).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
