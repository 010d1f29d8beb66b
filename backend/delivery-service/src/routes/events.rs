use actix_web::{http::header, web, HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::broker::sse::event_stream;
use crate::error::{AppError, AppResult};
use crate::services::validate_topic;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub topic: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEventRequest {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Server-Sent Events stream of one topic.
///
/// GET {EVENT_STREAM_PATH}?topic=...
pub async fn stream(
    state: web::Data<AppState>,
    query: web::Query<StreamQuery>,
) -> AppResult<HttpResponse> {
    validate_topic(&query.topic)?;

    let subscription = state.broker.subscribe(&query.topic);
    tracing::info!(
        subscriber_id = %subscription.id(),
        topic = %query.topic,
        "Event stream opened"
    );

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(event_stream(subscription, state.config.stream_heartbeat)))
}

/// Publish a moderation or system event.
///
/// POST /events/{topic}
pub async fn publish(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<PublishEventRequest>,
) -> AppResult<HttpResponse> {
    let topic = path.into_inner();
    let PublishEventRequest { event_type, data } = body.into_inner();

    let delivered = state
        .delivery
        .publish_moderation_event(&topic, &event_type, data)
        .map_err(AppError::from)?;

    Ok(HttpResponse::Ok().json(json!({
        "topic": topic,
        "eventType": event_type,
        "delivered": delivered,
    })))
}

/// The stream route comes first so its path wins over `/events/{topic}`.
pub fn register_routes(cfg: &mut web::ServiceConfig, stream_path: &str) {
    cfg.service(web::resource(stream_path).route(web::get().to(stream)))
        .service(web::resource("/events/{topic}").route(web::post().to(publish)));
}
