use serde::{Deserialize, Serialize};

/// Kind of a durable event row.
///
/// Closed enumeration: the event writer rejects anything else before I/O, so
/// the audit log can only ever contain these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionRegistered,
    SessionEnded,
    TurnDetected,
    StateTransition,
    HookReceived,
    HookSessionStart,
    HookSessionEnd,
    HookUserPrompt,
    HookStop,
    HookNotification,
    HookPostToolUse,
    QuestionDetected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionRegistered => "session_registered",
            EventKind::SessionEnded => "session_ended",
            EventKind::TurnDetected => "turn_detected",
            EventKind::StateTransition => "state_transition",
            EventKind::HookReceived => "hook_received",
            EventKind::HookSessionStart => "hook_session_start",
            EventKind::HookSessionEnd => "hook_session_end",
            EventKind::HookUserPrompt => "hook_user_prompt",
            EventKind::HookStop => "hook_stop",
            EventKind::HookNotification => "hook_notification",
            EventKind::HookPostToolUse => "hook_post_tool_use",
            EventKind::QuestionDetected => "question_detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    pub const ALL: [EventKind; 12] = [
        EventKind::SessionRegistered,
        EventKind::SessionEnded,
        EventKind::TurnDetected,
        EventKind::StateTransition,
        EventKind::HookReceived,
        EventKind::HookSessionStart,
        EventKind::HookSessionEnd,
        EventKind::HookUserPrompt,
        EventKind::HookStop,
        EventKind::HookNotification,
        EventKind::HookPostToolUse,
        EventKind::QuestionDetected,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Types delivered on the SSE stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    SessionCreated,
    SessionEnded,
    CardRefresh,
    StateTransition,
    ObjectiveChanged,
    PriorityUpdated,
    ActivityMetricUpdated,
    ApiCallLogged,
    CommanderAvailabilityChanged,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventKind::SessionCreated => "session_created",
            StreamEventKind::SessionEnded => "session_ended",
            StreamEventKind::CardRefresh => "card_refresh",
            StreamEventKind::StateTransition => "state_transition",
            StreamEventKind::ObjectiveChanged => "objective_changed",
            StreamEventKind::PriorityUpdated => "priority_updated",
            StreamEventKind::ActivityMetricUpdated => "activity_metric_updated",
            StreamEventKind::ApiCallLogged => "api_call_logged",
            StreamEventKind::CommanderAvailabilityChanged => "commander_availability_changed",
        }
    }
}

impl std::fmt::Display for StreamEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level of an oracle invocation, for the inference call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceLevel {
    Turn,
    Command,
    Project,
    Priority,
}

impl InferenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceLevel::Turn => "turn",
            InferenceLevel::Command => "command",
            InferenceLevel::Project => "project",
            InferenceLevel::Priority => "priority",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "turn" => Some(InferenceLevel::Turn),
            "command" => Some(InferenceLevel::Command),
            "project" => Some(InferenceLevel::Project),
            "priority" => Some(InferenceLevel::Priority),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_parse_covers_every_kind() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("made_up"), None);
    }

    #[test]
    fn event_kind_serialises_as_snake_case() {
        let json = serde_json::to_string(&EventKind::HookPostToolUse).unwrap();
        assert_eq!(json, "\"hook_post_tool_use\"");
    }

    #[test]
    fn stream_event_kind_strings_match_wire_contract() {
        assert_eq!(StreamEventKind::CardRefresh.as_str(), "card_refresh");
        assert_eq!(
            StreamEventKind::CommanderAvailabilityChanged.as_str(),
            "commander_availability_changed"
        );
    }
}
