// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use confab_sfu::{ErrorKind, SfuError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

impl From<SfuError> for AppError {
    fn from(err: SfuError) -> Self {
        let status = match err.kind() {
            ErrorKind::ProtocolViolation => StatusCode::BAD_REQUEST,
            ErrorKind::ResourceExhaustion => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::EngineFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Closed => StatusCode::GONE,
        };
        Self::new(status, err.to_string())
    }
}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_sfu::RoomId;

    #[test]
    fn test_sfu_error_status() {
        let err = AppError::from(SfuError::RoomNotFound(RoomId::from("r1")));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "Room not found: r1");

        assert_eq!(
            AppError::from(SfuError::RoomFull(RoomId::from("r1"))).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(AppError::from(SfuError::ShuttingDown).status, StatusCode::GONE);
    }
}
