// HTTP mapping for engine errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::PubflowError;

impl PubflowError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PubflowError::NotFound(_) => StatusCode::NOT_FOUND,
            PubflowError::InvalidState(_) => StatusCode::CONFLICT,
            PubflowError::Config(_) | PubflowError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PubflowError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PubflowError::Storage(_)
            | PubflowError::Serialization(_)
            | PubflowError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PubflowError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("request failed: {}", self);
        }
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfigError;

    #[test]
    fn test_status_codes() {
        let cases = [
            (PubflowError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (PubflowError::InvalidState("x".into()), StatusCode::CONFLICT),
            (
                PubflowError::Config(ConfigError::InvalidDuration("0".into())),
                StatusCode::BAD_REQUEST,
            ),
            (PubflowError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (PubflowError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
