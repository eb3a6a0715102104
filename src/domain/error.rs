//! Request-path error type.
//!
//! Every error that can reach the HTTP surface carries a status code so the
//! handler can translate it without inspecting sources. The type is `Clone`
//! because single-flight shares one result among every concurrent caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// Upstream confirmed absence, or the unknown-author short-circuit.
    #[error("not found")]
    NotFound,
    /// Malformed or out-of-range identifiers and parameters.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Upstream asked us to slow down (HTTP 429).
    #[error("rate limited by upstream")]
    RateLimited,
    /// Any other upstream 4xx/5xx, proxied through with its original code.
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    /// Cached or upstream bytes failed to deserialize.
    #[error("decode error: {0}")]
    Decode(String),
    /// Network-level failure talking to the upstream.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProxyError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Map an upstream status code onto the matching variant.
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            429 => Self::RateLimited,
            other => Self::Status(other),
        }
    }

    /// The HTTP status this error should surface as. Defaults to 500 for
    /// kinds with no inherent code.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Status(code) => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Decode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16());
        }
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        assert_eq!(ProxyError::from_status(404), ProxyError::NotFound);
        assert_eq!(ProxyError::from_status(429), ProxyError::RateLimited);
        assert_eq!(ProxyError::from_status(502), ProxyError::Status(502));

        assert_eq!(ProxyError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyError::RateLimited.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyError::Status(503).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::decode("oops").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
