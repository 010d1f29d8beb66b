pub mod events;
pub mod jobs;
pub mod keys;
pub mod messages;
pub mod signaling;

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::metrics;
use crate::state::AppState;

pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "delivery-service",
        "subscribers": state.broker.total_subscribers(),
        "topics": state.broker.topic_count(),
        "signalingRooms": state.relay.room_count(),
    }))
}

/// Every route of the service. `stream_path` is the configured SSE path.
pub fn register_routes(cfg: &mut web::ServiceConfig, stream_path: &str) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics::serve_metrics));
    events::register_routes(cfg, stream_path);
    keys::register_routes(cfg);
    messages::register_routes(cfg);
    jobs::register_routes(cfg);
    signaling::register_routes(cfg);
}
