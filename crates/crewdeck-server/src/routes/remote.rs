use std::time::Duration;

use axum::Json;
use axum::extract::{Path, RawQuery, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use crewdeck_store::queries::{agent, persona, project};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::run_blocking;
use crate::state::AppState;
use crate::tokens::{FeatureFlags, TokenInfo};

/// CORS for the externally embedded surface: applied to every response on
/// the remote-agent namespace when the Origin is allowed.
pub async fn cors_layer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let is_remote = request.uri().path().starts_with("/api/remote_agents/");
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut response = next.run(request).await;
    if !is_remote {
        return response;
    }

    let Some(origin) = origin else {
        return response;
    };
    let allowed = &state.config.remote_agents.allowed_origins;
    if allowed.iter().any(|o| o == &origin || o == "*") {
        use axum::http::HeaderValue;
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert("access-control-allow-origin", value);
        }
        headers.insert(
            "access-control-allow-methods",
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            "access-control-allow-headers",
            HeaderValue::from_static("Authorization, Content-Type"),
        );
        headers.insert(
            "access-control-allow-credentials",
            HeaderValue::from_static("true"),
        );
        headers.insert("access-control-max-age", HeaderValue::from_static("3600"));
    }
    response
}

pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn bearer_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_string());
    }
    // Query-parameter fallback for the embed iframe.
    query.and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(str::to_string)
    })
}

fn require_token(state: &AppState, headers: &HeaderMap, query: Option<&str>, agent_id: i64) -> Result<TokenInfo> {
    let Some(token) = bearer_token(headers, query) else {
        return Err(Error::Unauthorized("Session token is required".to_string()));
    };
    state
        .tokens
        .validate_for_agent(&token, agent_id)
        .ok_or_else(|| Error::Unauthorized("Invalid or expired session token".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct RemoteCreateBody {
    pub project_slug: Option<String>,
    pub persona_slug: Option<String>,
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub feature_flags: Option<PartialFlags>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PartialFlags {
    pub file_upload: Option<bool>,
    pub context_usage: Option<bool>,
    pub voice_mic: Option<bool>,
}

/// `POST /api/remote_agents/create`: create an agent, wait for its pane,
/// mint the scoped token, deliver the initial prompt.
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<RemoteCreateBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let Some(project_slug) = body.project_slug.filter(|s| !s.is_empty()) else {
        return Err(Error::Validation("project_slug is required".to_string()));
    };
    let Some(persona_slug) = body.persona_slug.filter(|s| !s.is_empty()) else {
        return Err(Error::Validation("persona_slug is required".to_string()));
    };
    let Some(initial_prompt) = body.initial_prompt.filter(|s| !s.is_empty()) else {
        return Err(Error::Validation("initial_prompt is required".to_string()));
    };

    let storage = state.storage.clone();
    let slug = project_slug.clone();
    let persona_for_check = persona_slug.clone();
    let project_row = run_blocking(move || {
        let db = storage.connect()?;
        let project_row = project::get_by_slug(db.conn(), &slug)?
            .ok_or_else(|| Error::NotFound(format!("project {slug} not found")))?;
        persona::get_by_slug(db.conn(), &persona_for_check)?
            .ok_or_else(|| Error::NotFound(format!("persona {persona_for_check} not found")))?;
        Ok(project_row)
    })
    .await?;

    let receipt = state
        .lifecycle
        .create(project_row.id, Some(&persona_slug), None)
        .await
        .map_err(|err| match err {
            Error::Unavailable(msg) => Error::Unavailable(msg),
            Error::Domain(msg) => Error::NotFound(msg),
            other => other,
        })?;

    // Wait for pane readiness within the creation budget.
    let deadline = Duration::from_secs(state.config.remote_agents.creation_timeout_seconds);
    let pane = wait_for_pane(&state, receipt.agent_id, deadline).await?;

    let defaults = &state.config.remote_agents.embed_defaults;
    let overrides = body.feature_flags.unwrap_or_default();
    let flags = FeatureFlags {
        file_upload: overrides.file_upload.unwrap_or(defaults.file_upload),
        context_usage: overrides.context_usage.unwrap_or(defaults.context_usage),
        voice_mic: overrides.voice_mic.unwrap_or(defaults.voice_mic),
    };
    let token = state.tokens.generate(receipt.agent_id, flags.clone());

    state.bridge.send_text(&pane, &initial_prompt).await?;

    let embed_url = format!(
        "{}/embed/agents/{}?token={}",
        state
            .config
            .server
            .application_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", state.config.server.host, state.config.server.port)),
        receipt.agent_id,
        token
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "agent_id": receipt.agent_id,
            "session_token": token,
            "embed_url": embed_url,
            "tmux_session_name": receipt.tmux_session_name,
            "feature_flags": flags,
        })),
    ))
}

async fn wait_for_pane(state: &AppState, agent_id: i64, deadline: Duration) -> Result<String> {
    let started = std::time::Instant::now();
    loop {
        let storage = state.storage.clone();
        let agent_row = run_blocking(move || {
            let db = storage.connect()?;
            Ok(agent::get(db.conn(), agent_id)?)
        })
        .await?;
        if let Some(pane) = agent_row.and_then(|a| a.tmux_pane_id) {
            return Ok(pane);
        }
        if started.elapsed() >= deadline {
            return Err(Error::ReadyTimeout(format!(
                "agent {agent_id} did not become ready within {}s",
                deadline.as_secs()
            )));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// `GET /api/remote_agents/{id}/alive`, agent-scoped token required.
pub async fn alive(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    require_token(&state, &headers, query.as_deref(), agent_id)?;

    let storage = state.storage.clone();
    let agent_row = run_blocking(move || {
        let db = storage.connect()?;
        Ok(agent::get(db.conn(), agent_id)?)
    })
    .await?
    .ok_or_else(|| Error::NotFound("agent_not_found".to_string()))?;

    Ok(Json(json!({
        "alive": agent_row.ended_at.is_none(),
        "agent_id": agent_id,
        "last_seen_at": agent_row.last_seen_at.to_rfc3339(),
    })))
}

/// `POST /api/remote_agents/{id}/shutdown`, agent-scoped token required.
pub async fn shutdown(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    require_token(&state, &headers, query.as_deref(), agent_id)?;

    let outcome = state.lifecycle.shutdown(agent_id).await.map_err(|err| match err {
        Error::NotFound(_) => Error::NotFound("agent_not_found".to_string()),
        other => other,
    })?;

    let message = match outcome {
        crate::lifecycle::ShutdownOutcome::Initiated => "Agent shutdown initiated",
        crate::lifecycle::ShutdownOutcome::AlreadyTerminated => "Agent already terminated",
    };
    state.tokens.revoke_for_agent(agent_id);
    Ok(Json(json!({"status": "ok", "message": message})))
}
