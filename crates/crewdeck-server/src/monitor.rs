use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};

/// PID-file based liveness for the standalone watcher process.
///
/// The watcher writes its PID on start and removes the file on graceful
/// stop; the HTTP service reads it to report `degraded` when the watcher is
/// absent or the file has gone stale.
#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    pid_file: PathBuf,
    stale_after: Duration,
}

impl ProcessMonitor {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
            stale_after: Duration::from_secs(120),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn write_pid_file(&self) -> Result<()> {
        if let Some(parent) = self.pid_file.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Fatal(format!("cannot create pid dir: {e}")))?;
        }
        std::fs::write(&self.pid_file, format!("{}\n", std::process::id()))
            .map_err(|e| Error::Fatal(format!("cannot write pid file: {e}")))
    }

    /// Re-stamp the file mtime so liveness reflects the loop, not the boot.
    pub fn touch(&self) {
        if let Err(err) = std::fs::write(&self.pid_file, format!("{}\n", std::process::id())) {
            tracing::warn!(%err, "pid file touch failed");
        }
    }

    pub fn remove_pid_file(&self) {
        if let Err(err) = std::fs::remove_file(&self.pid_file)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(%err, "pid file removal failed");
        }
    }

    /// True only when the file exists and was stamped recently.
    pub fn watcher_running(&self) -> bool {
        let Ok(metadata) = std::fs::metadata(&self.pid_file) else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age <= self.stale_after)
            .unwrap_or(true)
    }

    pub fn watcher_pid(&self) -> Option<u32> {
        let content = std::fs::read_to_string(&self.pid_file).ok()?;
        content.trim().parse().ok()
    }
}
