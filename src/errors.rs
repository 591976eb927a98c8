use crate::services::coordinator::CoordinatorError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// An HTTP-facing error: status, stable code, and a message safe to show callers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        let status = match &err {
            CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::UploadNotFound(_) | CoordinatorError::PartNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            CoordinatorError::AlreadyExists(_) | CoordinatorError::ConflictingState(_) => {
                StatusCode::CONFLICT
            }
            CoordinatorError::Finalization(_) | CoordinatorError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn coordinator_errors_map_to_http_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (CoordinatorError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (CoordinatorError::UploadNotFound(id), StatusCode::NOT_FOUND),
            (
                CoordinatorError::PartNotFound {
                    upload_id: id,
                    part_number: 3,
                },
                StatusCode::NOT_FOUND,
            ),
            (CoordinatorError::AlreadyExists(id), StatusCode::CONFLICT),
            (CoordinatorError::ConflictingState("done".into()), StatusCode::CONFLICT),
            (
                CoordinatorError::Finalization("merge".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (CoordinatorError::Internal, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[tokio::test]
    async fn error_body_carries_code_and_status() {
        let err = AppError::from(CoordinatorError::Internal);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "internal_error");
        assert_eq!(json["status"], 500);
        assert_eq!(json["error"], "internal error");
    }
}
