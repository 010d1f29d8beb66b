//! Public-key directory. Secret keys never pass through these routes.

use actix_web::{web, HttpResponse};
use crypto_core::PublicKey;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishKeyRequest {
    /// Standard base64 of the 32-byte X25519 public key
    pub public_key: String,
}

/// PUT /keys/{principal_id}
pub async fn publish_key(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<PublishKeyRequest>,
) -> AppResult<HttpResponse> {
    let principal_id = path.into_inner();
    let public_key = PublicKey::from_base64(&body.public_key)
        .map_err(|e| AppError::BadRequest(format!("publicKey: {e}")))?;

    let record = state.keys.publish(principal_id, public_key).await?;
    Ok(HttpResponse::Ok().json(record))
}

/// GET /keys/{principal_id}
pub async fn get_key(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let record = state.keys.record(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(record))
}

/// DELETE /keys/{principal_id}
pub async fn remove_key(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    state.keys.remove(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/keys").service(
            web::resource("/{principal_id}")
                .route(web::put().to(publish_key))
                .route(web::get().to(get_key))
                .route(web::delete().to(remove_key)),
        ),
    );
}
