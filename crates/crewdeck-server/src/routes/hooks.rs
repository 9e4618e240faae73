use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use crewdeck_engine::HookOutcome;
use crewdeck_types::{CardState, HookKind, HookPayload, StreamEventKind};
use serde_json::{Value, json};

use crate::error::Result;
use crate::run_blocking;
use crate::state::AppState;

pub async fn session_start(state: State<AppState>, payload: Json<HookPayload>) -> Result<Json<Value>> {
    handle(state, HookKind::SessionStart, payload).await
}

pub async fn session_end(state: State<AppState>, payload: Json<HookPayload>) -> Result<Json<Value>> {
    handle(state, HookKind::SessionEnd, payload).await
}

pub async fn user_prompt_submit(state: State<AppState>, payload: Json<HookPayload>) -> Result<Json<Value>> {
    handle(state, HookKind::UserPromptSubmit, payload).await
}

pub async fn stop(state: State<AppState>, payload: Json<HookPayload>) -> Result<Json<Value>> {
    handle(state, HookKind::Stop, payload).await
}

pub async fn notification(state: State<AppState>, payload: Json<HookPayload>) -> Result<Json<Value>> {
    handle(state, HookKind::Notification, payload).await
}

pub async fn post_tool_use(state: State<AppState>, payload: Json<HookPayload>) -> Result<Json<Value>> {
    handle(state, HookKind::PostToolUse, payload).await
}

async fn handle(
    State(state): State<AppState>,
    kind: HookKind,
    Json(payload): Json<HookPayload>,
) -> Result<Json<Value>> {
    let pipeline = Arc::clone(&state.pipeline);
    let for_pipeline = payload.clone();
    let outcome = run_blocking(move || Ok(pipeline.process(kind, &for_pipeline)?)).await?;

    sync_registry(&state, kind, &payload, &outcome);
    publish(&state, kind, &outcome);

    Ok(Json(json!({
        "success": outcome.success,
        "agent_id": outcome.agent_id,
        "state_changed": outcome.state_changed,
        "new_state": outcome.new_state.map(|s| CardState::from(s).as_str()),
    })))
}

/// The in-process registry mirrors hook traffic so the reaper knows which
/// sessions are alive even when the standalone watcher is not running.
fn sync_registry(state: &AppState, kind: HookKind, payload: &HookPayload, outcome: &HookOutcome) {
    let now = Utc::now();
    match kind {
        HookKind::SessionStart => {
            if let Some(dir) = payload.working_directory.as_deref() {
                state.registry.register(&payload.claude_session_id, dir, Some(dir), now);
            }
        }
        HookKind::SessionEnd => {
            state.registry.remove(&payload.claude_session_id);
        }
        _ => {
            state.registry.touch(&payload.claude_session_id, now);
        }
    }
    if outcome.agent_ended {
        state.registry.remove(&payload.claude_session_id);
    }
}

fn publish(state: &AppState, kind: HookKind, outcome: &HookOutcome) {
    let Some(agent_id) = outcome.agent_id else {
        return;
    };

    if outcome.agent_created {
        state.broadcaster.broadcast(
            StreamEventKind::SessionCreated,
            json!({"agent_id": agent_id, "reason": kind.as_str()}),
        );
    }
    if outcome.agent_ended {
        state.broadcaster.broadcast(
            StreamEventKind::SessionEnded,
            json!({"agent_id": agent_id, "reason": kind.as_str()}),
        );
    }
    if outcome.state_changed {
        state.broadcaster.broadcast(
            StreamEventKind::StateTransition,
            json!({
                "agent_id": agent_id,
                "to_state": outcome.new_state.map(|s| CardState::from(s).as_str()),
                "trigger": kind.as_str(),
            }),
        );
    }
    // Any hook that touched an agent refreshes its card.
    state.broadcaster.broadcast(
        StreamEventKind::CardRefresh,
        json!({"agent_id": agent_id, "reason": kind.as_str()}),
    );
}
