use std::time::Instant;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use crewdeck_store::queries::api_log::{self, NewApiCallLog};
use crewdeck_types::StreamEventKind;
use serde_json::json;

use crate::state::AppState;

/// Route prefixes whose traffic is captured.
const CAPTURED_PREFIXES: &[&str] = &["/api/", "/hook/"];

/// Headers whose values never reach storage.
const REDACTED_HEADERS: &[&str] = &["authorization", "cookie", "x-api-key"];

const CAPTURE_CAP: usize = 2 * 1024 * 1024;

/// Captures API transactions (method, path, status, latency, redacted
/// headers and bodies) for the declared prefixes. Capture failures never
/// fail the request.
pub async fn api_log_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if !CAPTURED_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let authenticated = request.headers().contains_key("authorization");
    let headers = redacted_headers(&request);

    let (parts, body) = request.into_parts();
    let (request, request_body) = match to_bytes(body, CAPTURE_CAP).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (Request::from_parts(parts, Body::from(bytes)), Some(text))
        }
        Err(err) => {
            tracing::warn!(%err, "request body capture failed");
            (Request::from_parts(parts, Body::empty()), None)
        }
    };

    let started = Instant::now();
    let response = next.run(request).await;
    finish(state, method, path, authenticated, headers, request_body, started, response).await
}

#[allow(clippy::too_many_arguments)]
async fn finish(
    state: AppState,
    method: String,
    path: String,
    authenticated: bool,
    headers: String,
    request_body: Option<String>,
    started: Instant,
    response: Response,
) -> Response {
    let status = response.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as i64;

    // Buffer the response body so it can be stored and re-emitted.
    let (parts, body) = response.into_parts();
    let (response, response_body) = match to_bytes(body, CAPTURE_CAP).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (Response::from_parts(parts, Body::from(bytes)), Some(text))
        }
        Err(err) => {
            tracing::warn!(%err, "response body capture failed");
            (Response::from_parts(parts, Body::empty()), None)
        }
    };

    let storage = state.storage.clone();
    let broadcaster = state.broadcaster.clone();
    let method_for_event = method.clone();
    let path_for_event = path.clone();
    tokio::task::spawn_blocking(move || {
        let write = storage.connect().and_then(|db| {
            api_log::insert(
                db.conn(),
                &NewApiCallLog {
                    method: &method,
                    path: &path,
                    status_code: status,
                    latency_ms,
                    authenticated,
                    request_headers: Some(&headers),
                    request_body: request_body.as_deref(),
                    response_body: response_body.as_deref(),
                },
                Utc::now(),
            )
        });
        match write {
            Ok(_) => broadcaster.broadcast(
                StreamEventKind::ApiCallLogged,
                json!({
                    "method": method_for_event,
                    "path": path_for_event,
                    "status": status,
                    "latency_ms": latency_ms,
                }),
            ),
            Err(err) => tracing::warn!(%err, "api call log write failed"),
        }
    });

    response
}

fn redacted_headers(request: &Request) -> String {
    let mut map = serde_json::Map::new();
    for (name, value) in request.headers() {
        let key = name.as_str().to_lowercase();
        let rendered = if REDACTED_HEADERS.contains(&key.as_str()) {
            "[redacted]".to_string()
        } else {
            value.to_str().unwrap_or("[binary]").to_string()
        };
        map.insert(key, serde_json::Value::String(rendered));
    }
    serde_json::Value::Object(map).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_headers_are_redacted() {
        let request = Request::builder()
            .uri("/api/agents")
            .header("authorization", "Bearer sekrit")
            .header("content-type", "application/json")
            .body(Body::empty())
            .unwrap();
        let rendered = redacted_headers(&request);
        assert!(!rendered.contains("sekrit"));
        assert!(rendered.contains("[redacted]"));
        assert!(rendered.contains("application/json"));
    }

    #[test]
    fn capture_is_prefix_scoped() {
        assert!(CAPTURED_PREFIXES.iter().any(|p| "/api/agents".starts_with(p)));
        assert!(CAPTURED_PREFIXES.iter().any(|p| "/hook/stop".starts_with(p)));
        assert!(!CAPTURED_PREFIXES.iter().any(|p| "/health".starts_with(p)));
    }
}
