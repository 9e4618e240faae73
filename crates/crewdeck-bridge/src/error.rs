use std::fmt;

/// Result type for crewdeck-bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Typed failures from the multiplexer bridge. The caller decides which of
/// these are fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    TmuxNotInstalled,
    NoPaneId,
    PaneNotFound(String),
    Timeout,
    SendFailed(String),
    SubprocessFailed(String),
    Unknown(String),
}

impl BridgeError {
    /// Stable machine-readable code for logs and API errors.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::TmuxNotInstalled => "TMUX_NOT_INSTALLED",
            BridgeError::NoPaneId => "NO_PANE_ID",
            BridgeError::PaneNotFound(_) => "PANE_NOT_FOUND",
            BridgeError::Timeout => "TIMEOUT",
            BridgeError::SendFailed(_) => "SEND_FAILED",
            BridgeError::SubprocessFailed(_) => "SUBPROCESS_FAILED",
            BridgeError::Unknown(_) => "UNKNOWN",
        }
    }

    /// Pane disappearance is inferred from multiplexer stderr.
    pub fn classify_stderr(stderr: &str, fallback: BridgeError) -> BridgeError {
        let lower = stderr.to_lowercase();
        const PANE_GONE: &[&str] = &["can't find pane", "no such session", "pane not found"];
        if PANE_GONE.iter().any(|needle| lower.contains(needle)) {
            BridgeError::PaneNotFound(stderr.trim().to_string())
        } else {
            fallback
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::TmuxNotInstalled => write!(f, "tmux is not installed"),
            BridgeError::NoPaneId => write!(f, "agent has no pane id"),
            BridgeError::PaneNotFound(detail) => write!(f, "pane not found: {}", detail),
            BridgeError::Timeout => write!(f, "multiplexer call timed out"),
            BridgeError::SendFailed(detail) => write!(f, "send failed: {}", detail),
            BridgeError::SubprocessFailed(detail) => write!(f, "subprocess failed: {}", detail),
            BridgeError::Unknown(detail) => write!(f, "unknown bridge error: {}", detail),
        }
    }
}

impl std::error::Error for BridgeError {}
