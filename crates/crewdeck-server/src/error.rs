use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Result type for crewdeck-server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server-side error taxonomy, mapped onto the uniform nested envelope
/// `{"error": {code, message, status, retryable, retry_after_seconds?}}`.
#[derive(Debug)]
pub enum Error {
    /// Caller-visible input problem; 4xx, never retried.
    Validation(String),
    /// Referenced entity does not exist.
    NotFound(String),
    /// Input was well-formed but violates a domain rule.
    Domain(String),
    /// Bearer token missing or wrong.
    Unauthorized(String),
    /// Advisory lock could not be acquired in time; retryable.
    LockTimeout,
    /// A collaborating subsystem is missing or down.
    Unavailable(String),
    /// Agent did not become ready within the creation timeout; retryable.
    ReadyTimeout(String),
    /// Storage-layer failure.
    Store(crewdeck_store::Error),
    /// Multiplexer failure.
    Bridge(crewdeck_bridge::BridgeError),
    /// Invalid configuration or schema; the process should exit.
    Fatal(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Domain(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::LockTimeout => StatusCode::SERVICE_UNAVAILABLE,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ReadyTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Store(_) | Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Bridge(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::NotFound(_) => "not_found",
            Error::Domain(_) => "domain_error",
            Error::Unauthorized(_) => "invalid_session_token",
            Error::LockTimeout => "lock_timeout",
            Error::Unavailable(_) => "service_unavailable",
            Error::ReadyTimeout(_) => "ready_timeout",
            Error::Store(_) => "storage_error",
            Error::Bridge(_) => "bridge_error",
            Error::Fatal(_) => "fatal_error",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout | Error::Unavailable(_) | Error::ReadyTimeout(_)
        )
    }

    fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Error::LockTimeout => Some(1),
            Error::Unavailable(_) => Some(5),
            Error::ReadyTimeout(_) => Some(10),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Error::Validation(msg)
            | Error::NotFound(msg)
            | Error::Domain(msg)
            | Error::Unauthorized(msg)
            | Error::Unavailable(msg)
            | Error::ReadyTimeout(msg)
            | Error::Fatal(msg) => msg.clone(),
            Error::LockTimeout => "agent is busy, retry shortly".to_string(),
            Error::Store(err) => err.to_string(),
            Error::Bridge(err) => err.to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for Error {}

impl From<crewdeck_store::Error> for Error {
    fn from(err: crewdeck_store::Error) -> Self {
        match err {
            crewdeck_store::Error::LockTimeout { .. } => Error::LockTimeout,
            crewdeck_store::Error::Validation(msg) => Error::Validation(msg),
            other => Error::Store(other),
        }
    }
}

impl From<crewdeck_bridge::BridgeError> for Error {
    fn from(err: crewdeck_bridge::BridgeError) -> Self {
        Error::Bridge(err)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
                "status": status.as_u16(),
                "retryable": self.retryable(),
                "retry_after_seconds": self.retry_after_seconds(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        assert_eq!(Error::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Domain("x".into()).status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(Error::LockTimeout.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(Error::ReadyTimeout("x".into()).status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(Error::LockTimeout.retryable());
        assert!(Error::Unavailable("x".into()).retryable());
        assert!(Error::ReadyTimeout("x".into()).retryable());
        assert!(!Error::Validation("x".into()).retryable());
        assert!(!Error::NotFound("x".into()).retryable());
    }

    #[test]
    fn store_lock_timeout_converts_to_retryable_api_error() {
        let err: Error = crewdeck_store::Error::LockTimeout { namespace: 1, key: 7 }.into();
        assert!(matches!(err, Error::LockTimeout));
        assert!(err.retryable());
    }
}
