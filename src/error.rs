//! Proxy error types and their HTTP responses.
//!
//! Every failure carries its kind up to the response-writing step, where it is
//! mapped to a status code. Anything that is not a caller mistake or a rate
//! limit becomes a 500 with only the message exposed.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Forbidden")]
    Forbidden,

    #[error("Bad Request - Missing query")]
    BadRequest,

    #[error("Method Not Allowed")]
    MethodNotAllowed,

    #[error("Too many requests, please try again later.")]
    RateLimited { retry_after: u64 },

    #[error("Failed to obtain app access token: {0}")]
    UpstreamAuth(String),

    #[error("Failed to fetch data from upstream API (HTTP {status})")]
    UpstreamFetch { status: u16 },

    #[error("Credential store error: {0}")]
    Store(String),

    #[error("Upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Forbidden => StatusCode::FORBIDDEN,
            ProxyError::BadRequest => StatusCode::BAD_REQUEST,
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamAuth(_)
            | ProxyError::UpstreamFetch { .. }
            | ProxyError::Store(_)
            | ProxyError::Http(_)
            | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Gate rejections speak in `message`, forwarding failures in `error`.
        let body = if status.is_server_error() {
            json!({ "error": self.to_string() })
        } else {
            json!({ "message": self.to_string() })
        };

        let mut response = (status, Json(body)).into_response();

        if let ProxyError::RateLimited { retry_after } = &self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after));
        }

        response
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
