use std::time::Duration;

use actix_web::{web, HttpResponse};
use job_queue::EnqueueOptions;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::NOTIFICATIONS_QUEUE;
use crate::state::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub delay_secs: u64,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// Only queues with a worker pool exist as far as HTTP callers can tell.
fn ensure_served(queue: &str) -> AppResult<()> {
    if queue == NOTIFICATIONS_QUEUE {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("queue {queue}")))
    }
}

/// POST /jobs/{queue}
pub async fn enqueue(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<EnqueueRequest>,
) -> AppResult<HttpResponse> {
    let queue = path.into_inner();
    ensure_served(&queue)?;

    let EnqueueRequest {
        kind,
        payload,
        delay_secs,
        max_attempts,
    } = body.into_inner();
    let mut opts = EnqueueOptions::default().with_delay(Duration::from_secs(delay_secs));
    if let Some(max_attempts) = max_attempts {
        opts = opts.with_max_attempts(max_attempts);
    }

    let job_id = state.queue.enqueue_raw(&queue, &kind, payload, opts).await?;
    Ok(HttpResponse::Accepted().json(json!({ "jobId": job_id })))
}

/// GET /jobs/{job_id}
pub async fn get_job(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let record = state.queue.get(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(record))
}

/// POST /jobs/{job_id}/replay
pub async fn replay_job(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let record = state.queue.replay(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(record))
}

/// GET /queues/{queue}/dead-letters?limit=N
pub async fn dead_letters(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<LimitQuery>,
) -> AppResult<HttpResponse> {
    let queue = path.into_inner();
    ensure_served(&queue)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);

    let jobs = state.queue.dead_letters(&queue, limit).await?;
    Ok(HttpResponse::Ok().json(json!({
        "queueName": queue,
        "count": jobs.len(),
        "jobs": jobs,
    })))
}

/// GET /queues/{queue}/stats
pub async fn queue_stats(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let queue = path.into_inner();
    ensure_served(&queue)?;
    let stats = state.queue.stats(&queue).await?;
    Ok(HttpResponse::Ok().json(stats))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/jobs")
            .route("/{job_id}/replay", web::post().to(replay_job))
            .route("/{job_id}", web::get().to(get_job))
            .route("/{queue}", web::post().to(enqueue)),
    )
    .service(
        web::scope("/queues")
            .route("/{queue}/dead-letters", web::get().to(dead_letters))
            .route("/{queue}/stats", web::get().to(queue_stats)),
    );
}
