use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use crewdeck_engine::AgentCard;
use crewdeck_store::queries::agent;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::lifecycle::ShutdownOutcome;
use crate::run_blocking;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAgentBody {
    pub project_id: Option<i64>,
    #[serde(default)]
    pub persona_slug: Option<String>,
    #[serde(default)]
    pub previous_agent_id: Option<i64>,
}

/// `POST /api/agents`: 201 with the creation receipt; readiness is
/// reported later through the hook pipeline.
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateAgentBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let Some(project_id) = body.project_id else {
        return Err(Error::Validation("project_id is required".to_string()));
    };

    let receipt = state
        .lifecycle
        .create(project_id, body.persona_slug.as_deref(), body.previous_agent_id)
        .await?;

    state.broadcaster.broadcast(
        crewdeck_types::StreamEventKind::SessionCreated,
        json!({"agent_id": receipt.agent_id, "reason": "api_create"}),
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "agent_id": receipt.agent_id,
            "tmux_session_name": receipt.tmux_session_name,
            "tmux_pane_id": receipt.tmux_pane_id,
            "project_slug": receipt.project_slug,
        })),
    ))
}

/// `DELETE /api/agents/{id}`: non-blocking shutdown initiation.
pub async fn shutdown(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
) -> Result<Json<Value>> {
    let outcome = state.lifecycle.shutdown(agent_id).await?;
    let message = match outcome {
        ShutdownOutcome::Initiated => "Agent shutdown initiated",
        ShutdownOutcome::AlreadyTerminated => "Agent already terminated",
    };
    Ok(Json(json!({"status": "ok", "message": message})))
}

/// `GET /api/agents`: current card projection of every live agent.
pub async fn list_cards(State(state): State<AppState>) -> Result<Json<Vec<AgentCard>>> {
    let storage = state.storage.clone();
    let projector = state.projector.clone();
    let cards = run_blocking(move || {
        let db = storage.connect()?;
        let now = Utc::now();
        let mut cards = Vec::new();
        for agent_row in agent::list_live(db.conn())? {
            cards.push(projector.project(db.conn(), &agent_row, now)?);
        }
        Ok(cards)
    })
    .await?;
    Ok(Json(cards))
}

/// `GET /api/agents/{id}/context`: parse the REPL's context line out of a
/// fresh pane capture and persist the triplet.
pub async fn context(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
) -> Result<Json<Value>> {
    let storage = state.storage.clone();
    let agent_row = run_blocking(move || {
        let db = storage.connect()?;
        Ok(agent::get(db.conn(), agent_id)?)
    })
    .await?
    .ok_or_else(|| Error::NotFound(format!("agent {agent_id} does not exist")))?;

    let Some(pane_id) = agent_row.tmux_pane_id.clone() else {
        return Ok(Json(json!({"available": false, "reason": "agent has no pane"})));
    };

    let captured = match state.bridge.capture_pane(&pane_id, 40).await {
        Ok(captured) => captured,
        Err(err) => {
            return Ok(Json(json!({"available": false, "reason": err.to_string()})));
        }
    };

    match crewdeck_bridge::parse_context_usage(&captured) {
        Some(usage) => {
            let storage = state.storage.clone();
            let persisted = usage.clone();
            run_blocking(move || {
                let db = storage.connect()?;
                agent::set_context_usage(
                    db.conn(),
                    agent_id,
                    persisted.percent_used,
                    &persisted.remaining_tokens,
                    Utc::now(),
                )?;
                Ok(())
            })
            .await?;
            Ok(Json(json!({
                "available": true,
                "percent_used": usage.percent_used,
                "remaining_tokens": usage.remaining_tokens,
                "raw": usage.raw,
            })))
        }
        None => Ok(Json(json!({
            "available": false,
            "reason": "no context line in pane capture",
        }))),
    }
}
