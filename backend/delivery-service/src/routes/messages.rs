use actix_web::{web, HttpResponse};
use crypto_core::Envelope;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::DeliveryRoute;
use crate::state::AppState;

/// Longest system message body, in bytes.
const MAX_SYSTEM_MESSAGE_LEN: usize = 16 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMessageRequest {
    pub recipient_id: Uuid,
    pub body: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMessageResponse {
    pub envelope: Envelope,
    #[serde(flatten)]
    pub route: DeliveryRoute,
}

/// Submit an envelope sealed by the sender's client.
///
/// POST /messages
pub async fn send_message(
    state: web::Data<AppState>,
    body: web::Json<Envelope>,
) -> AppResult<HttpResponse> {
    let route = state.delivery.send_envelope(body.into_inner()).await?;
    Ok(HttpResponse::Accepted().json(route))
}

/// Seal and send a message from the system principal.
///
/// POST /messages/system
pub async fn send_system_message(
    state: web::Data<AppState>,
    body: web::Json<SystemMessageRequest>,
) -> AppResult<HttpResponse> {
    let SystemMessageRequest { recipient_id, body } = body.into_inner();
    if body.is_empty() || body.len() > MAX_SYSTEM_MESSAGE_LEN {
        return Err(AppError::BadRequest(format!(
            "body must be 1..={MAX_SYSTEM_MESSAGE_LEN} bytes"
        )));
    }

    let (envelope, route) = state
        .delivery
        .send_system_message(recipient_id, body.as_bytes())
        .await?;
    Ok(HttpResponse::Accepted().json(SystemMessageResponse { envelope, route }))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/messages")
            .route("", web::post().to(send_message))
            .route("/system", web::post().to(send_system_message)),
    );
}
