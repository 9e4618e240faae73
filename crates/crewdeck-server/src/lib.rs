pub mod api_log;
pub mod availability;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod reaper;
pub mod routes;
pub mod state;
pub mod tokens;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;

/// Run a storage-bound closure off the async runtime.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Fatal(format!("blocking task panicked: {e}")))?
}
