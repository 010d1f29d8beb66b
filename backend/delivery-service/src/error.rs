use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use crypto_core::{CryptoError, KeyStoreError};
use job_queue::JobError;
use serde::Serialize;
use thiserror::Error;

use crate::broker::ConnectionDropped;
use crate::services::DeliveryError;
use crate::signaling::RelayError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("key missing: {0}")]
    KeyMissing(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("connection dropped: {0}")]
    ConnectionDropped(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl AppError {
    /// Stable machine-readable code for the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::StartServer(_) => "start_failure",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::KeyMissing(_) => "key_missing",
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::Conflict(_) => "conflict",
            AppError::ConnectionDropped(_) => "connection_dropped",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ServiceUnavailable(_))
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) | AppError::KeyMissing(_) => StatusCode::NOT_FOUND,
            AppError::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ConnectionDropped(_) => StatusCode::GONE,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        // Internal details stay in the logs.
        let message = match self {
            AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        HttpResponse::build(status).json(ErrorBody {
            error: self.code(),
            message,
        })
    }
}

impl From<KeyStoreError> for AppError {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::KeyMissing(_) => AppError::KeyMissing(e.to_string()),
            KeyStoreError::Backend(msg) => AppError::ServiceUnavailable(msg),
        }
    }
}

impl From<CryptoError> for AppError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Encryption | CryptoError::KeyDerivation => AppError::Internal(e.to_string()),
            _ => AppError::BadRequest(e.to_string()),
        }
    }
}

impl From<JobError> for AppError {
    fn from(e: JobError) -> Self {
        match &e {
            JobError::InvalidPayload { .. } => AppError::InvalidPayload(e.to_string()),
            JobError::InvalidOptions(_) => AppError::BadRequest(e.to_string()),
            JobError::NotFound(_) => AppError::NotFound(e.to_string()),
            JobError::InvalidState { .. } | JobError::LeaseLost(_) => {
                AppError::Conflict(e.to_string())
            }
            JobError::Backend(_) => AppError::ServiceUnavailable(e.to_string()),
            JobError::AttemptsExceeded { .. }
            | JobError::Serialization(_)
            | JobError::Other(_) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<RelayError> for AppError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::RoomFull { .. } => AppError::Conflict(e.to_string()),
            RelayError::SamePeer | RelayError::InvalidId(_) => AppError::BadRequest(e.to_string()),
        }
    }
}

impl From<ConnectionDropped> for AppError {
    fn from(e: ConnectionDropped) -> Self {
        AppError::ConnectionDropped(e.to_string())
    }
}

impl From<DeliveryError> for AppError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::KeyStore(e) => e.into(),
            DeliveryError::Crypto(e) => e.into(),
            DeliveryError::Job(e) => e.into(),
            DeliveryError::InvalidEnvelope(_) => AppError::InvalidPayload(e.to_string()),
            DeliveryError::InvalidTopic(_)
            | DeliveryError::InvalidEventType(_)
            | DeliveryError::ReservedTopic(_) => AppError::BadRequest(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let missing: AppError = KeyStoreError::KeyMissing(Uuid::nil()).into();
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let invalid: AppError = JobError::InvalidPayload {
            kind: "summary".into(),
            reason: "windowHours".into(),
        }
        .into();
        assert_eq!(invalid.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

        let full: AppError = RelayError::RoomFull {
            room_id: "r".into(),
        }
        .into();
        assert_eq!(full.status_code(), StatusCode::CONFLICT);

        let backend: AppError = JobError::Backend("down".into()).into();
        assert!(backend.is_retryable());
        assert_eq!(backend.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let response = AppError::Internal("secret detail".into()).error_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
