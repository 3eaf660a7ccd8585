use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use huddle_protocol::{ErrorKind, ErrorPayload};
use serde_json::json;
use thiserror::Error;

/// Failure of a signaling request or of a session bookkeeping step
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Room creation failed: {0}")]
    RoomCreationFailed(String),

    #[error("Transport creation failed: {0}")]
    TransportCreationFailed(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Cannot consume producer {0} with the given capabilities")]
    CapabilityMismatch(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Media engine did not answer {0} in time")]
    EngineTimeout(&'static str),

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::RoomCreationFailed(_) => ErrorKind::RoomCreationFailed,
            SessionError::TransportCreationFailed(_) => ErrorKind::TransportCreationFailed,
            SessionError::TransportNotFound(_) => ErrorKind::TransportNotFound,
            SessionError::CapabilityMismatch(_) => ErrorKind::CapabilityMismatch,
            SessionError::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            SessionError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            SessionError::EngineTimeout(_) => ErrorKind::EngineTimeout,
            SessionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Wire form of this error. Engine internals are logged, not forwarded.
    pub fn to_payload(&self) -> ErrorPayload {
        let message = match self {
            SessionError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        ErrorPayload {
            kind: self.kind(),
            message,
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::ResourceNotFound | ErrorKind::TransportNotFound => StatusCode::NOT_FOUND,
            ErrorKind::ProtocolViolation | ErrorKind::CapabilityMismatch => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::EngineTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_payload()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
