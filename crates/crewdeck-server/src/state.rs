use std::sync::Arc;

use crewdeck_bridge::TmuxBridge;
use crewdeck_engine::{CardProjector, Correlator, CorrelatorConfig, HookPipeline};
use crewdeck_ingest::SessionRegistry;
use crewdeck_store::{AdvisoryLockManager, EventWriter, Storage};

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::error::Result;
use crate::lifecycle::AgentLifecycle;
use crate::monitor::ProcessMonitor;
use crate::tokens::SessionTokenService;

/// Long-lived services constructed once at process start and injected into
/// handlers and workers. No module-level singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Storage,
    pub locks: AdvisoryLockManager,
    pub pipeline: Arc<HookPipeline>,
    pub broadcaster: Broadcaster,
    pub bridge: Arc<TmuxBridge>,
    pub tokens: Arc<SessionTokenService>,
    pub registry: Arc<SessionRegistry>,
    pub monitor: ProcessMonitor,
    pub projector: CardProjector,
    pub lifecycle: Arc<AgentLifecycle>,
}

impl AppState {
    pub fn build(config: Config) -> Result<Self> {
        let storage = Storage::open(config.database.resolved_path())?;
        let locks = AdvisoryLockManager::new(storage.clone());
        let writer = EventWriter::new(
            storage.clone(),
            config.event_system.write_retry_attempts,
            config.event_system.write_retry_delay_ms,
        );
        let pipeline = Arc::new(HookPipeline::new(
            storage.clone(),
            locks.clone(),
            writer,
            Correlator::new(CorrelatorConfig::default()),
        ));
        let broadcaster = Broadcaster::new(config.sse.buffer_size);
        let bridge = Arc::new(TmuxBridge::new(config.tmux_bridge.to_bridge_config()));
        let tokens = Arc::new(SessionTokenService::new());
        let registry = Arc::new(SessionRegistry::new());
        let monitor = ProcessMonitor::new(config.file_watcher.pid_file.clone());
        let projector = CardProjector {
            stale_processing_seconds: config.dashboard.stale_processing_seconds,
            active_timeout_minutes: config.dashboard.active_timeout_minutes,
        };
        let lifecycle = Arc::new(AgentLifecycle::new(
            storage.clone(),
            Arc::clone(&bridge),
            Arc::clone(&tokens),
            config.guardrails.document.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            storage,
            locks,
            pipeline,
            broadcaster,
            bridge,
            tokens,
            registry,
            monitor,
            projector,
            lifecycle,
        })
    }
}
