use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::buffer::BufferError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    BadRequest(String),
    #[error("request body too large")]
    BodyTooLarge,
    #[error("origin fetch failed: {0}")]
    Origin(#[from] reqwest::Error),
    #[error("invalid origin url: {0}")]
    OriginUrl(#[from] url::ParseError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Origin(_) | ProxyError::OriginUrl(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Buffer(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::BadRequest("Missing ?domain=xxx".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::OriginUrl(url::ParseError::EmptyHost).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Buffer(BufferError::ActorUnavailable("a.com".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_bad_request_body_is_message() {
        let err = ProxyError::BadRequest("Missing ?domain=xxx".into());
        assert_eq!(err.to_string(), "Missing ?domain=xxx");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
