use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use crewdeck_engine::{Correlator, CorrelatorConfig};
use crewdeck_ingest::{SessionRegistry, WatcherService};
use crewdeck_server::monitor::ProcessMonitor;
use crewdeck_server::Config;
use crewdeck_store::queries::{agent, event::EventRefs};
use crewdeck_store::{AdvisoryLockManager, EventWriter, LockNamespace, Storage};
use crewdeck_types::EventKind;
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Standalone transcript watcher: tails per-session JSONL files and writes
/// turns, transitions, and events to the shared store. Takes no arguments
/// beyond the shared configuration.
#[derive(Debug, Parser)]
#[command(name = "crewdeck-watcher", version)]
struct Cli {
    /// Path to the configuration document (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
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
    let storage = Storage::open(config.database.resolved_path()).context("opening store")?;
    let monitor = ProcessMonitor::new(config.file_watcher.pid_file.clone());
    monitor.write_pid_file().context("writing pid file")?;

    let stop = Arc::new(AtomicBool::new(false));
    install_stop_handler(Arc::clone(&stop));

    let locks = AdvisoryLockManager::new(storage.clone());
    let writer = Arc::new(EventWriter::new(
        storage.clone(),
        config.event_system.write_retry_attempts,
        config.event_system.write_retry_delay_ms,
    ));
    let correlator = Arc::new(Correlator::new(CorrelatorConfig::default()));

    let registry = Arc::new(SessionRegistry::new());
    seed_registry_from_store(&storage, &registry);

    let mut watcher = WatcherService::new(config.watcher_config(), Arc::clone(&registry));

    {
        let storage = storage.clone();
        let locks = locks.clone();
        let writer = Arc::clone(&writer);
        let correlator = Arc::clone(&correlator);
        watcher.set_on_turn(Box::new(move |entry, parsed| {
            let result = deliver_turn(&storage, &locks, &writer, &correlator, &entry.session_uuid, parsed);
            if let Err(err) = result {
                tracing::warn!(session = %entry.session_uuid, %err, "turn delivery failed");
            }
        }));
    }
    {
        let storage = storage.clone();
        let writer = Arc::clone(&writer);
        watcher.set_on_session_end(Box::new(move |entry, reason| {
            let close = close_session(&storage, &writer, &entry.session_uuid, reason);
            if let Err(err) = close {
                tracing::warn!(session = %entry.session_uuid, %err, "session close failed");
            }
        }));
    }

    tracing::info!(pid = std::process::id(), "watcher running");
    let watcher_config = config.watcher_config();
    let monitor_for_loop = monitor.clone();
    let storage_for_loop = storage.clone();
    watcher.run(&stop, move || {
        monitor_for_loop.touch();
        // Hooks seen recently mean the tail is just a safety net; otherwise
        // this process is the only observer and polls on the fast cadence.
        let hooks_active = storage_for_loop
            .connect()
            .ok()
            .and_then(|db| {
                crewdeck_store::queries::event::latest_hook_event_at(db.conn()).ok().flatten()
            })
            .map(|at| chrono::Utc::now() - at < chrono::Duration::seconds(300))
            .unwrap_or(false);
        if hooks_active {
            watcher_config.hook_active_interval
        } else {
            watcher_config.polling_interval
        }
    });

    monitor.remove_pid_file();
    tracing::info!("watcher stopped");
    Ok(())
}

fn install_stop_handler(stop: Arc<AtomicBool>) {
    #[cfg(unix)]
    unsafe {
        static STOP: std::sync::OnceLock<Arc<AtomicBool>> = std::sync::OnceLock::new();
        let _ = STOP.set(stop);
        extern "C" fn handle(_sig: libc::c_int) {
            if let Some(stop) = STOP.get() {
                stop.store(true, Ordering::SeqCst);
            }
        }
        let handler = handle as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
    }
    #[cfg(not(unix))]
    let _ = stop;
}

/// On restart the registry is rebuilt from live agents; tail offsets start
/// at zero and the hash dedup absorbs the replay.
fn seed_registry_from_store(storage: &Storage, registry: &SessionRegistry) {
    let seeded = (|| -> crewdeck_store::Result<usize> {
        let db = storage.connect()?;
        let live = agent::list_live(db.conn())?;
        let mut count = 0;
        for agent_row in &live {
            if agent_row.session_uuid.starts_with("pending-") {
                continue;
            }
            let Some(project) =
                crewdeck_store::queries::project::get(db.conn(), agent_row.project_id)?
            else {
                continue;
            };
            // Activity restarts fresh so a reboot does not instantly reap
            // sessions that were merely quiet while we were down.
            registry.register(
                &agent_row.session_uuid,
                &project.path,
                Some(&project.path),
                chrono::Utc::now(),
            );
            count += 1;
        }
        Ok(count)
    })();
    match seeded {
        Ok(count) => tracing::info!(count, "registry seeded from store"),
        Err(err) => tracing::warn!(%err, "registry seeding failed"),
    }
}

fn deliver_turn(
    storage: &Storage,
    locks: &AdvisoryLockManager,
    writer: &EventWriter,
    correlator: &Correlator,
    session_uuid: &str,
    parsed: crewdeck_ingest::ParsedTurn,
) -> crewdeck_store::Result<()> {
    let agent_row = {
        let db = storage.connect()?;
        agent::get_by_session_uuid(db.conn(), session_uuid)?
    };
    let Some(agent_row) = agent_row else {
        tracing::debug!(session = session_uuid, "turn for unknown agent, skipping");
        return Ok(());
    };

    let _guard = locks.lock(
        LockNamespace::Agent,
        agent_row.id,
        std::time::Duration::from_secs(10),
    )?;

    let mut db = storage.connect()?;
    let tx = db.conn_mut().transaction()?;
    let observed = parsed.to_observed();
    correlator.process_turn(&tx, writer, &agent_row, &observed)?;
    tx.commit()?;
    Ok(())
}

fn close_session(
    storage: &Storage,
    writer: &EventWriter,
    session_uuid: &str,
    reason: &str,
) -> crewdeck_store::Result<()> {
    let db = storage.connect()?;
    let agent_row = agent::get_by_session_uuid(db.conn(), session_uuid)?;
    if let Some(agent_row) = &agent_row
        && agent_row.ended_at.is_none()
        && let Err(err) = agent::mark_ended(db.conn(), agent_row.id, chrono::Utc::now())
    {
        tracing::debug!(agent = agent_row.id, %err, "agent already ended");
    }
    let result = writer.write(
        EventKind::SessionEnded,
        json!({"reason": reason, "session_uuid": session_uuid}),
        agent_row.map(|a| EventRefs::agent(a.id)).unwrap_or_default(),
    );
    if !result.success {
        tracing::warn!(error = ?result.error, "session_ended write failed");
    }
    Ok(())
}
