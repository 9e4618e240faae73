use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use crewdeck_engine::{CachingOracle, Oracle, OracleError, PriorityScorer, Summariser};
use crewdeck_server::routes;
use crewdeck_server::{AppState, Config};
use tracing_subscriber::EnvFilter;

/// Fleet observer and control deck for terminal AI coding agents.
#[derive(Debug, Parser)]
#[command(name = "crewdeck-server", version)]
struct Cli {
    /// Path to the configuration document (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    // Reset SIGPIPE to default behavior to prevent panic on broken pipe
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::build(config).context("building application state")?;

    // The oracle implementation is injected here; without a configured
    // provider the summariser and scorer stay idle rather than fabricate.
    let oracle: Option<Arc<dyn Oracle>> = oracle_from_env();
    let (scorer, summariser) = match oracle {
        Some(oracle) => (
            Some(PriorityScorer::new(
                state.storage.clone(),
                CachingOracle::new(state.storage.clone(), Arc::clone(&oracle)),
            )),
            Some(Summariser::new(
                state.storage.clone(),
                CachingOracle::new(state.storage.clone(), oracle),
            )),
        ),
        None => {
            tracing::info!("no oracle configured; summarisation and priority scoring disabled");
            (None, None)
        }
    };

    crewdeck_server::reaper::spawn_workers(state.clone(), scorer, summariser);

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(%bind_addr, "crewdeck server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

/// Stub oracle wiring: an external command named by CREWDECK_ORACLE_CMD
/// receives the prompt on stdin and prints the completion.
fn oracle_from_env() -> Option<Arc<dyn Oracle>> {
    let command = std::env::var("CREWDECK_ORACLE_CMD").ok()?;
    Some(Arc::new(move |prompt: &str| {
        use std::io::Write;
        use std::process::{Command, Stdio};

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(prompt.as_bytes())
                .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        if !output.status.success() {
            return Err(OracleError::Unavailable(format!(
                "oracle command exited with {}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }))
}
