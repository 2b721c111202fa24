// Bearer authentication for the RPC API

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use super::AppState;
use crate::PubflowError;

/// The token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Reject requests without one of the configured API tokens
///
/// With no tokens configured every request passes.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    if state.config.api_tokens.is_empty() {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);

    match token {
        Some(token) if state.config.api_tokens.iter().any(|t| t == token) => {
            debug!(path = %request.uri().path(), "authorized request");
            next.run(request).await
        }
        Some(_) => {
            warn!(path = %request.uri().path(), "rejected unknown bearer token");
            PubflowError::Unauthorized("invalid bearer token".to_string()).into_response()
        }
        None => PubflowError::Unauthorized("missing bearer token".to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc123"), None);
        assert_eq!(bearer_token("abc123"), None);
    }
}
