use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};

use crate::api_log::api_log_middleware;
use crate::state::AppState;

pub mod agents;
pub mod health;
pub mod hooks;
pub mod personas;
pub mod remote;
pub mod stream;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/hook/session-start", post(hooks::session_start))
        .route("/hook/session-end", post(hooks::session_end))
        .route("/hook/user-prompt-submit", post(hooks::user_prompt_submit))
        .route("/hook/stop", post(hooks::stop))
        .route("/hook/notification", post(hooks::notification))
        .route("/hook/post-tool-use", post(hooks::post_tool_use))
        .route("/api/agents", post(agents::create).get(agents::list_cards))
        .route("/api/agents/{id}", delete(agents::shutdown))
        .route("/api/agents/{id}/context", get(agents::context))
        .route("/api/personas/register", post(personas::register))
        .route("/api/personas/active", get(personas::active))
        .route(
            "/api/remote_agents/create",
            post(remote::create).options(remote::preflight),
        )
        .route(
            "/api/remote_agents/{id}/alive",
            get(remote::alive).options(remote::preflight),
        )
        .route(
            "/api/remote_agents/{id}/shutdown",
            post(remote::shutdown).options(remote::preflight),
        )
        .route("/api/events/stream", get(stream::events_stream))
        .layer(middleware::from_fn_with_state(state.clone(), api_log_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), remote::cors_layer))
        .with_state(state)
}
