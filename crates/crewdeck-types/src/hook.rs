use serde::{Deserialize, Serialize};

use crate::EventKind;

/// Hook callbacks fired by the host when a conversation passes through a
/// known point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    Stop,
    Notification,
    PostToolUse,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::SessionStart => "session_start",
            HookKind::SessionEnd => "session_end",
            HookKind::UserPromptSubmit => "user_prompt_submit",
            HookKind::Stop => "stop",
            HookKind::Notification => "notification",
            HookKind::PostToolUse => "post_tool_use",
        }
    }

    /// URL segment used by the `/hook/<kind>` route family.
    pub fn route_segment(&self) -> &'static str {
        match self {
            HookKind::SessionStart => "session-start",
            HookKind::SessionEnd => "session-end",
            HookKind::UserPromptSubmit => "user-prompt-submit",
            HookKind::Stop => "stop",
            HookKind::Notification => "notification",
            HookKind::PostToolUse => "post-tool-use",
        }
    }

    /// The audit event recorded for every incoming hook of this kind.
    pub fn event_kind(&self) -> EventKind {
        match self {
            HookKind::SessionStart => EventKind::HookSessionStart,
            HookKind::SessionEnd => EventKind::HookSessionEnd,
            HookKind::UserPromptSubmit => EventKind::HookUserPrompt,
            HookKind::Stop => EventKind::HookStop,
            HookKind::Notification => EventKind::HookNotification,
            HookKind::PostToolUse => EventKind::HookPostToolUse,
        }
    }

    pub const ALL: [HookKind; 6] = [
        HookKind::SessionStart,
        HookKind::SessionEnd,
        HookKind::UserPromptSubmit,
        HookKind::Stop,
        HookKind::Notification,
        HookKind::PostToolUse,
    ];
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver mode controlling the transcript watcher cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookMode {
    HooksActive,
    PollingFallback,
}

impl HookMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookMode::HooksActive => "hooks_active",
            HookMode::PollingFallback => "polling_fallback",
        }
    }
}

/// Body of an incoming hook callback.
///
/// `claude_session_id` is the host-side conversation identifier shared with
/// the JSONL transcript; everything else is kind-specific and optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookPayload {
    pub claude_session_id: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Prompt text on `user_prompt_submit`.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Notification message on `notification`.
    #[serde(default)]
    pub message: Option<String>,
    /// Tool name on `post_tool_use`.
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    /// Raw tool output on `post_tool_use`; error output is sanitised before
    /// anything downstream sees it.
    #[serde(default)]
    pub tool_output: Option<String>,
}
