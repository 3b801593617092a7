use crate::error::DeliveryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            DeliveryError::NotFound("track") => (StatusCode::NOT_FOUND, "Track not found".to_string()),
            DeliveryError::NotFound("session") => (StatusCode::NOT_FOUND, "Session not found".to_string()),
            DeliveryError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found".to_string()),
            DeliveryError::InvalidInput(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            DeliveryError::Storage(_) => {
                tracing::error!(error = %self, "storage failure while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Error getting audio file".to_string())
            }
            DeliveryError::Internal(_) => {
                tracing::error!(error = %self, "internal failure while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (DeliveryError::NotFound("track"), StatusCode::NOT_FOUND),
            (DeliveryError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (DeliveryError::Storage("42/320.mp3".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (DeliveryError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
