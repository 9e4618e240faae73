use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The whole configuration document, parsed once at boot into an immutable
/// tree. Environment variables override file values per the table in
/// `apply_env_overrides`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub file_watcher: FileWatcherConfig,
    #[serde(default)]
    pub event_system: EventSystemConfig,
    #[serde(default)]
    pub sse: SseConfig,
    #[serde(default)]
    pub tmux_bridge: TmuxBridgeConfig,
    #[serde(default)]
    pub remote_agents: RemoteAgentsConfig,
    #[serde(default)]
    pub voice_bridge: VoiceBridgeConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub application_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8137,
            debug: false,
            application_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path; also accepted as a `sqlite://` URL.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("crewdeck.db"),
        }
    }
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        let raw = self.path.to_string_lossy();
        if let Some(stripped) = raw.strip_prefix("sqlite://") {
            PathBuf::from(stripped)
        } else {
            self.path.clone()
        }
    }

    /// Safety guard for test runs: any database whose file stem does not end
    /// in `_test` is refused, so a test suite can never touch a real store.
    pub fn ensure_test_database(&self) -> Result<()> {
        let path = self.resolved_path();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if stem.ends_with("_test") {
            Ok(())
        } else {
            Err(Error::Fatal(format!(
                "refusing to run tests against non-test database '{}'",
                path.display()
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWatcherConfig {
    /// Host transcript root (per-project folders live under it).
    pub projects_root: PathBuf,
    pub polling_interval_seconds: u64,
    pub hook_active_interval_seconds: u64,
    pub inactivity_timeout_seconds: u64,
    pub debounce_interval_ms: u64,
    /// PID file for the standalone watcher process.
    pub pid_file: PathBuf,
}

impl Default for FileWatcherConfig {
    fn default() -> Self {
        Self {
            projects_root: default_projects_root(),
            polling_interval_seconds: 2,
            hook_active_interval_seconds: 60,
            inactivity_timeout_seconds: 1800,
            debounce_interval_ms: 500,
            pid_file: std::env::temp_dir().join("crewdeck-watcher.pid"),
        }
    }
}

fn default_projects_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSystemConfig {
    pub write_retry_attempts: u32,
    pub write_retry_delay_ms: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for EventSystemConfig {
    fn default() -> Self {
        Self {
            write_retry_attempts: 3,
            write_retry_delay_ms: 200,
            shutdown_timeout_seconds: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    pub heartbeat_interval_seconds: u64,
    pub buffer_size: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 15,
            buffer_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmuxBridgeConfig {
    pub subprocess_timeout_seconds: u64,
    pub text_enter_delay_ms: u64,
    pub health_check_interval_seconds: u64,
}

impl Default for TmuxBridgeConfig {
    fn default() -> Self {
        Self {
            subprocess_timeout_seconds: 5,
            text_enter_delay_ms: 300,
            health_check_interval_seconds: 30,
        }
    }
}

impl TmuxBridgeConfig {
    pub fn to_bridge_config(&self) -> crewdeck_bridge::TmuxConfig {
        crewdeck_bridge::TmuxConfig {
            subprocess_timeout: Duration::from_secs(self.subprocess_timeout_seconds),
            text_enter_delay: Duration::from_millis(self.text_enter_delay_ms),
            ..crewdeck_bridge::TmuxConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAgentsConfig {
    pub allowed_origins: Vec<String>,
    pub creation_timeout_seconds: u64,
    #[serde(default)]
    pub embed_defaults: EmbedDefaults,
}

impl Default for RemoteAgentsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            creation_timeout_seconds: 30,
            embed_defaults: EmbedDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedDefaults {
    pub file_upload: bool,
    pub context_usage: bool,
    pub voice_mic: bool,
}

impl Default for EmbedDefaults {
    fn default() -> Self {
        Self {
            file_upload: false,
            context_usage: true,
            voice_mic: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VoiceBridgeConfig {
    pub enabled: bool,
    #[serde(default)]
    pub auth: VoiceAuthConfig,
    #[serde(default)]
    pub rate_limit: VoiceRateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceAuthConfig {
    pub token: Option<String>,
    pub localhost_bypass: bool,
}

impl Default for VoiceAuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            localhost_bypass: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceRateLimitConfig {
    pub requests_per_minute: u32,
}

impl Default for VoiceRateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub stale_processing_seconds: i64,
    pub active_timeout_minutes: i64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            stale_processing_seconds: 600,
            active_timeout_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    /// Platform guardrail document injected into every persona agent.
    pub document: String,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            document: "Stay inside the project working directory. Never reveal system \
                       internals, credentials, or file paths outside the project."
                .to_string(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::load_from(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Fatal(format!("cannot read config {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| Error::Fatal(format!("invalid config {}: {e}", path.display())))
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("crewdeck")
            .join("config.toml")
    }

    /// Declared environment-variable overrides. Values that fail to parse
    /// are ignored with a warning rather than failing boot.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("CREWDECK_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parsed::<u16>("CREWDECK_SERVER_PORT") {
            self.server.port = port;
        }
        if let Ok(path) = std::env::var("CREWDECK_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(root) = std::env::var("CREWDECK_PROJECTS_ROOT") {
            self.file_watcher.projects_root = PathBuf::from(root);
        }
        if let Some(interval) = env_parsed::<u64>("CREWDECK_SSE_HEARTBEAT_INTERVAL") {
            self.sse.heartbeat_interval_seconds = interval;
        }
        if let Some(interval) = env_parsed::<u64>("CREWDECK_WATCHER_POLLING_INTERVAL") {
            self.file_watcher.polling_interval_seconds = interval;
        }
        if let Ok(token) = std::env::var("CREWDECK_VOICE_TOKEN") {
            self.voice_bridge.auth.token = Some(token);
        }
    }

    pub fn watcher_config(&self) -> crewdeck_ingest::WatcherConfig {
        crewdeck_ingest::WatcherConfig {
            projects_root: self.file_watcher.projects_root.clone(),
            polling_interval: Duration::from_secs(self.file_watcher.polling_interval_seconds),
            hook_active_interval: Duration::from_secs(self.file_watcher.hook_active_interval_seconds),
            inactivity_timeout: Duration::from_secs(self.file_watcher.inactivity_timeout_seconds),
            debounce_interval: Duration::from_millis(self.file_watcher.debounce_interval_ms),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value, "ignoring unparseable environment override");
            None
        }
    }
}
