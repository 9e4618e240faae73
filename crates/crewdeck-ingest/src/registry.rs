use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// A live session as the watcher sees it.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session_uuid: String,
    pub project_path: String,
    pub working_directory: Option<String>,
    pub pane_id: Option<String>,
    pub jsonl_path: Option<PathBuf>,
    pub registered_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Thread-safe map of live sessions, authoritative for "is this session
/// still live?". Mutations take the registry lock for microseconds; nothing
/// here blocks the hook path.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        session_uuid: &str,
        project_path: &str,
        working_directory: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let mut sessions = self.lock();
        sessions
            .entry(session_uuid.to_string())
            .and_modify(|entry| {
                entry.project_path = project_path.to_string();
                entry.working_directory = working_directory.map(str::to_string);
                entry.last_activity_at = now;
            })
            .or_insert_with(|| SessionEntry {
                session_uuid: session_uuid.to_string(),
                project_path: project_path.to_string(),
                working_directory: working_directory.map(str::to_string),
                pane_id: None,
                jsonl_path: None,
                registered_at: now,
                last_activity_at: now,
            });
    }

    pub fn get(&self, session_uuid: &str) -> Option<SessionEntry> {
        self.lock().get(session_uuid).cloned()
    }

    pub fn contains(&self, session_uuid: &str) -> bool {
        self.lock().contains_key(session_uuid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Bump `last_activity_at`; every observed turn and hook goes through
    /// here so the inactivity reaper sees live sessions as live.
    pub fn touch(&self, session_uuid: &str, now: DateTime<Utc>) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(session_uuid) {
            Some(entry) => {
                entry.last_activity_at = now;
                true
            }
            None => false,
        }
    }

    pub fn set_pane(&self, session_uuid: &str, pane_id: Option<&str>) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(session_uuid) {
            Some(entry) => {
                entry.pane_id = pane_id.map(str::to_string);
                true
            }
            None => false,
        }
    }

    pub fn set_jsonl_path(&self, session_uuid: &str, path: PathBuf) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(session_uuid) {
            Some(entry) => {
                entry.jsonl_path = Some(path);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session_uuid: &str) -> Option<SessionEntry> {
        self.lock().remove(session_uuid)
    }

    pub fn snapshot(&self) -> Vec<SessionEntry> {
        self.lock().values().cloned().collect()
    }

    /// Sessions idle past the timeout, candidates for closure.
    pub fn stale(&self, now: DateTime<Utc>, inactivity_timeout: Duration) -> Vec<SessionEntry> {
        self.lock()
            .values()
            .filter(|entry| now - entry.last_activity_at > inactivity_timeout)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
