use std::process::Output;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

use crate::error::{BridgeError, Result};
use crate::send_lock::SendLockRegistry;

/// Commands whose presence in a pane means the REPL is running.
const REPL_COMMANDS: &[&str] = &["claude", "node"];

#[derive(Debug, Clone)]
pub struct TmuxConfig {
    /// Hard cap per subprocess invocation.
    pub subprocess_timeout: Duration,
    /// Pause between literal text and the Enter key; compensates for the
    /// REPL's paste-detection heuristic.
    pub text_enter_delay: Duration,
    /// Pause between keys in a `send_keys` sequence.
    pub sequential_delay: Duration,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            subprocess_timeout: Duration::from_secs(5),
            text_enter_delay: Duration::from_millis(300),
            sequential_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaneInfo {
    pub pane_id: String,
    pub session_name: String,
    pub current_command: String,
    pub working_directory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaneHealth {
    pub available: bool,
    pub running: Option<bool>,
    pub pid: Option<u32>,
}

/// Thin, typed layer over the `tmux` binary.
pub struct TmuxBridge {
    config: TmuxConfig,
    send_locks: SendLockRegistry,
}

impl TmuxBridge {
    pub fn new(config: TmuxConfig) -> Self {
        Self {
            config,
            send_locks: SendLockRegistry::new(),
        }
    }

    pub async fn is_installed() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Literal text followed by Enter, as two calls with the configured
    /// delay between them. Holds the pane's send lock for the whole
    /// sequence.
    pub async fn send_text(&self, pane_id: &str, text: &str) -> Result<()> {
        if pane_id.is_empty() {
            return Err(BridgeError::NoPaneId);
        }
        let _guard = self.send_locks.acquire(pane_id).await;

        self.run(&["send-keys", "-t", pane_id, "-l", text], true).await?;
        tokio::time::sleep(self.config.text_enter_delay).await;
        self.run(&["send-keys", "-t", pane_id, "Enter"], true).await?;
        Ok(())
    }

    /// Named keys, one subprocess call per key.
    pub async fn send_keys(&self, pane_id: &str, keys: &[&str]) -> Result<()> {
        if pane_id.is_empty() {
            return Err(BridgeError::NoPaneId);
        }
        let _guard = self.send_locks.acquire(pane_id).await;

        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.sequential_delay).await;
            }
            self.run(&["send-keys", "-t", pane_id, key], true).await?;
        }
        Ok(())
    }

    /// Last `lines` rendered lines of the pane.
    pub async fn capture_pane(&self, pane_id: &str, lines: u32) -> Result<String> {
        if pane_id.is_empty() {
            return Err(BridgeError::NoPaneId);
        }
        let start = format!("-{lines}");
        let output = self
            .run(&["capture-pane", "-t", pane_id, "-p", "-S", &start], false)
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn list_panes(&self) -> Result<Vec<PaneInfo>> {
        let output = self
            .run(
                &[
                    "list-panes",
                    "-a",
                    "-F",
                    "#{pane_id}\t#{session_name}\t#{pane_current_command}\t#{pane_current_path}",
                ],
                false,
            )
            .await?;
        Ok(parse_pane_list(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Pane existence plus a process-name heuristic for "is the REPL still
    /// running in there".
    pub async fn check_health(&self, pane_id: &str) -> Result<PaneHealth> {
        if pane_id.is_empty() {
            return Err(BridgeError::NoPaneId);
        }
        let output = self
            .run(
                &["list-panes", "-a", "-F", "#{pane_id}\t#{pane_current_command}\t#{pane_pid}"],
                false,
            )
            .await;
        let output = match output {
            Ok(output) => output,
            Err(BridgeError::PaneNotFound(_)) => {
                return Ok(PaneHealth { available: false, running: None, pid: None });
            }
            Err(err) => return Err(err),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let mut fields = line.split('\t');
            let (Some(id), Some(command), pid) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if id == pane_id {
                return Ok(PaneHealth {
                    available: true,
                    running: Some(is_repl_command(command)),
                    pid: pid.and_then(|p| p.trim().parse().ok()),
                });
            }
        }
        Ok(PaneHealth { available: false, running: None, pid: None })
    }

    /// Detached session running `command` in `working_directory`.
    pub async fn new_session(
        &self,
        session_name: &str,
        working_directory: &str,
        command: &str,
    ) -> Result<()> {
        self.run(
            &["new-session", "-d", "-s", session_name, "-c", working_directory, command],
            true,
        )
        .await?;
        Ok(())
    }

    pub async fn kill_session(&self, session_name: &str) -> Result<()> {
        self.run(&["kill-session", "-t", session_name], true).await?;
        Ok(())
    }

    /// First pane id of a session, for wiring a freshly spawned agent.
    pub async fn first_pane_of_session(&self, session_name: &str) -> Result<Option<String>> {
        let panes = self.list_panes().await?;
        Ok(panes
            .into_iter()
            .find(|p| p.session_name == session_name)
            .map(|p| p.pane_id))
    }

    pub fn release_send_lock(&self, pane_id: &str) {
        self.send_locks.release(pane_id);
    }

    async fn run(&self, args: &[&str], is_send: bool) -> Result<Output> {
        let future = Command::new("tmux").args(args).output();
        let output = match tokio::time::timeout(self.config.subprocess_timeout, future).await {
            Err(_) => return Err(BridgeError::Timeout),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BridgeError::TmuxNotInstalled);
            }
            Ok(Err(err)) => return Err(BridgeError::SubprocessFailed(err.to_string())),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let fallback = if is_send {
                BridgeError::SendFailed(stderr.trim().to_string())
            } else {
                BridgeError::SubprocessFailed(stderr.trim().to_string())
            };
            tracing::debug!(?args, stderr = %stderr.trim(), "tmux call failed");
            return Err(BridgeError::classify_stderr(&stderr, fallback));
        }
        Ok(output)
    }
}

fn is_repl_command(command: &str) -> bool {
    REPL_COMMANDS.contains(&command.trim())
}

fn parse_pane_list(stdout: &str) -> Vec<PaneInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            Some(PaneInfo {
                pane_id: fields.next()?.to_string(),
                session_name: fields.next()?.to_string(),
                current_command: fields.next()?.to_string(),
                working_directory: fields.next()?.to_string(),
            })
        })
        .collect()
}
