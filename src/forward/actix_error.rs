//! Actix Web error adapters for devserver-runner errors.
//!
//! Lets [`forward_request`](crate::forward::forward_request) return
//! [`Error`] directly from a handler.

use crate::error::Error;
use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        HttpResponse::build(status_code)
            .content_type("application/json")
            .json(json!({
                "error": self.to_string(),
                "code": status_code.as_u16()
            }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            Error::UnmanagedServerNotFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Interrupted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::HealthCheckTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Forward(_) => StatusCode::BAD_GATEWAY,
            Error::ProcessExited { .. } => StatusCode::BAD_GATEWAY,
            Error::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::ConfigParse(_) => StatusCode::BAD_REQUEST,
            Error::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
