use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use walkdir::WalkDir;

use crate::codec::encode_project_path;
use crate::parser::{ParsedTurn, TranscriptReader};
use crate::registry::{SessionEntry, SessionRegistry};

/// Tuning for the transcript watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Root under which the host keeps per-project transcript folders.
    pub projects_root: PathBuf,
    /// Cadence when no hooks have been seen recently.
    pub polling_interval: StdDuration,
    /// Cadence while hooks are arriving; the tail is only a safety net then.
    pub hook_active_interval: StdDuration,
    /// Idle sessions past this are closed with reason "timeout".
    pub inactivity_timeout: StdDuration,
    /// Appends within this window coalesce into one read pass.
    pub debounce_interval: StdDuration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            projects_root: PathBuf::from("."),
            polling_interval: StdDuration::from_secs(2),
            hook_active_interval: StdDuration::from_secs(60),
            inactivity_timeout: StdDuration::from_secs(30 * 60),
            debounce_interval: StdDuration::from_millis(500),
        }
    }
}

pub type TurnCallback = Box<dyn Fn(&SessionEntry, ParsedTurn) + Send>;
pub type SessionEndCallback = Box<dyn Fn(&SessionEntry, &str) + Send>;

/// Single long-running worker that discovers and tails per-session JSONL
/// files, emitting parsed turns and inactivity closures through callbacks.
pub struct WatcherService {
    config: WatcherConfig,
    registry: Arc<SessionRegistry>,
    readers: HashMap<String, TranscriptReader>,
    last_read_at: HashMap<String, DateTime<Utc>>,
    on_turn: Option<TurnCallback>,
    on_session_end: Option<SessionEndCallback>,
}

impl WatcherService {
    pub fn new(config: WatcherConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            readers: HashMap::new(),
            last_read_at: HashMap::new(),
            on_turn: None,
            on_session_end: None,
        }
    }

    pub fn set_on_turn(&mut self, callback: TurnCallback) {
        self.on_turn = Some(callback);
    }

    pub fn set_on_session_end(&mut self, callback: SessionEndCallback) {
        self.on_session_end = Some(callback);
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// One full pass: discovery, tail reads, inactivity sweep.
    pub fn run_once(&mut self, now: DateTime<Utc>) {
        self.discover_transcripts();

        let sessions = self.registry.snapshot();
        for entry in &sessions {
            if entry.jsonl_path.is_some() {
                self.poll_session(&entry.session_uuid, now);
            }
        }

        self.close_stale_sessions(now);
    }

    /// Read the tail for one session immediately, bypassing the debounce.
    /// Hook arrivals use this so the transcript catches up right away.
    pub fn nudge(&mut self, session_uuid: &str) {
        self.discover_transcripts();
        self.last_read_at.remove(session_uuid);
        self.poll_session(session_uuid, Utc::now());
    }

    /// Run until `stop` flips, asking `interval` before each sleep so the
    /// hook receiver can switch cadence between passes.
    pub fn run(&mut self, stop: &AtomicBool, interval: impl Fn() -> StdDuration) {
        while !stop.load(Ordering::SeqCst) {
            self.run_once(Utc::now());
            let pause = interval();
            let mut slept = StdDuration::ZERO;
            // Sleep in slices so shutdown is prompt even on the long cadence.
            while slept < pause && !stop.load(Ordering::SeqCst) {
                let slice = StdDuration::from_millis(200).min(pause - slept);
                std::thread::sleep(slice);
                slept += slice;
            }
        }
    }

    fn discover_transcripts(&mut self) {
        for entry in self.registry.snapshot() {
            if entry.jsonl_path.is_some() {
                continue;
            }
            let folder = self
                .config
                .projects_root
                .join(encode_project_path(&entry.project_path));
            if let Some(path) = newest_jsonl(&folder) {
                tracing::info!(session = %entry.session_uuid, path = %path.display(), "transcript discovered");
                self.registry.set_jsonl_path(&entry.session_uuid, path.clone());
                self.readers
                    .insert(entry.session_uuid.clone(), TranscriptReader::new(path));
            }
        }
    }

    fn poll_session(&mut self, session_uuid: &str, now: DateTime<Utc>) {
        let Some(entry) = self.registry.get(session_uuid) else {
            return;
        };
        let Some(reader) = self.readers.get_mut(session_uuid) else {
            return;
        };

        let debounce = Duration::from_std(self.config.debounce_interval).unwrap_or_default();
        if let Some(last) = self.last_read_at.get(session_uuid)
            && now - *last < debounce
        {
            return;
        }

        if reader.pending_bytes() == 0 {
            return;
        }
        self.last_read_at.insert(session_uuid.to_string(), now);

        let turns = match reader.read_new_lines() {
            Ok(turns) => turns,
            Err(err) => {
                tracing::warn!(session = session_uuid, %err, "transcript read failed");
                return;
            }
        };
        if turns.is_empty() {
            return;
        }

        self.registry.touch(session_uuid, now);
        if let Some(on_turn) = &self.on_turn {
            for turn in turns {
                on_turn(&entry, turn);
            }
        }
    }

    fn close_stale_sessions(&mut self, now: DateTime<Utc>) {
        let timeout = Duration::from_std(self.config.inactivity_timeout).unwrap_or_default();
        for entry in self.registry.stale(now, timeout) {
            tracing::info!(session = %entry.session_uuid, "session idle past timeout, closing");
            self.registry.remove(&entry.session_uuid);
            self.readers.remove(&entry.session_uuid);
            self.last_read_at.remove(&entry.session_uuid);
            if let Some(on_end) = &self.on_session_end {
                on_end(&entry, "timeout");
            }
        }
    }
}

/// Newest `.jsonl` by modification time directly under `folder`.
fn newest_jsonl(folder: &Path) -> Option<PathBuf> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in WalkDir::new(folder)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() || path.extension().is_none_or(|e| e != "jsonl") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(mtime) = metadata.modified() else {
            continue;
        };
        match &newest {
            Some((best, _)) if *best >= mtime => {}
            _ => newest = Some((mtime, path.to_path_buf())),
        }
    }
    newest.map(|(_, path)| path)
}
