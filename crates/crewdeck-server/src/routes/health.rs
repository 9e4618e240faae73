use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::run_blocking;
use crate::state::AppState;

/// `200` always; the body says how well things are going. `degraded` covers
/// both a dead database and an absent watcher process.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let storage = state.storage.clone();
    let database_error = run_blocking(move || {
        storage.connect()?;
        Ok(())
    })
    .await
    .err()
    .map(|e| e.to_string());

    let watcher_running = state.monitor.watcher_running();
    let database_connected = database_error.is_none();
    let status = if database_connected && watcher_running {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "database": if database_connected { "connected" } else { "disconnected" },
        "watcher_running": watcher_running,
        "database_error": database_error,
    }))
}
