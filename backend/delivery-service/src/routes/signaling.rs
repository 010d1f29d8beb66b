use std::time::Duration;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppResult;
use crate::signaling::SendOutcome;
use crate::state::AppState;

/// Upper bound on a long poll.
const MAX_WAIT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    pub from_peer: String,
    pub to_peer: String,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    #[serde(default)]
    pub wait_secs: u64,
}

/// POST /signaling/{room_id}/messages
pub async fn send_signal(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<SignalRequest>,
) -> AppResult<HttpResponse> {
    let room_id = path.into_inner();
    let SignalRequest {
        from_peer,
        to_peer,
        payload,
    } = body.into_inner();

    let outcome = state.relay.send(&room_id, &from_peer, &to_peer, payload)?;
    Ok(match outcome {
        SendOutcome::Delivered => HttpResponse::Ok().json(outcome),
        SendOutcome::Buffered { .. } => HttpResponse::Accepted().json(outcome),
    })
}

/// Take the pending message for a peer. With `waitSecs` the peer holds an
/// open relay channel for up to that long.
///
/// GET /signaling/{room_id}/peers/{peer_id}?waitSecs=N
pub async fn poll_signal(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    query: web::Query<PollQuery>,
) -> AppResult<HttpResponse> {
    let (room_id, peer_id) = path.into_inner();

    if let Some(message) = state.relay.receive(&room_id, &peer_id) {
        return Ok(HttpResponse::Ok().json(message));
    }

    let wait = query.wait_secs.min(MAX_WAIT_SECS);
    if wait == 0 {
        return Ok(HttpResponse::NoContent().finish());
    }

    let mut channel = state.relay.connect(&room_id, &peer_id)?;
    match tokio::time::timeout(Duration::from_secs(wait), channel.recv()).await {
        Ok(Some(message)) => Ok(HttpResponse::Ok().json(message)),
        // Timed out, or replaced by a newer poll from the same peer.
        Ok(None) | Err(_) => Ok(HttpResponse::NoContent().finish()),
    }
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/signaling/{room_id}")
            .route("/messages", web::post().to(send_signal))
            .route("/peers/{peer_id}", web::get().to(poll_signal)),
    );
}
