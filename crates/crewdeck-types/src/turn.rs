use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnActor {
    User,
    Agent,
}

impl TurnActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnActor::User => "user",
            TurnActor::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TurnActor::User),
            "agent" => Some(TurnActor::Agent),
            _ => None,
        }
    }

    pub const ALL: [TurnActor; 2] = [TurnActor::User, TurnActor::Agent];
}

impl std::fmt::Display for TurnActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified purpose of a turn.
///
/// `end_of_task` survives in old rows and old callers; it is accepted on
/// input and normalised to `EndOfCommand`, which is the only spelling the
/// API emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnIntent {
    Command,
    Answer,
    Question,
    Completion,
    Progress,
    #[serde(alias = "end_of_task")]
    EndOfCommand,
}

impl TurnIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnIntent::Command => "command",
            TurnIntent::Answer => "answer",
            TurnIntent::Question => "question",
            TurnIntent::Completion => "completion",
            TurnIntent::Progress => "progress",
            TurnIntent::EndOfCommand => "end_of_command",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "command" => Some(TurnIntent::Command),
            "answer" => Some(TurnIntent::Answer),
            "question" => Some(TurnIntent::Question),
            "completion" => Some(TurnIntent::Completion),
            "progress" => Some(TurnIntent::Progress),
            "end_of_command" | "end_of_task" => Some(TurnIntent::EndOfCommand),
            _ => None,
        }
    }

    pub const ALL: [TurnIntent; 6] = [
        TurnIntent::Command,
        TurnIntent::Answer,
        TurnIntent::Question,
        TurnIntent::Completion,
        TurnIntent::Progress,
        TurnIntent::EndOfCommand,
    ];
}

impl std::fmt::Display for TurnIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a turn timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    Hook,
    Jsonl,
    Inferred,
}

impl TimestampSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampSource::Hook => "hook",
            TimestampSource::Jsonl => "jsonl",
            TimestampSource::Inferred => "inferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hook" => Some(TimestampSource::Hook),
            "jsonl" => Some(TimestampSource::Jsonl),
            "inferred" => Some(TimestampSource::Inferred),
            _ => None,
        }
    }
}

/// A turn observed on either ingest path, before correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedTurn {
    pub actor: TurnActor,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    /// SHA-256 over the canonicalised `actor` + `text`, when the turn came
    /// from a JSONL line.
    pub entry_hash: Option<String>,
    pub is_internal: bool,
    pub tool_input: Option<serde_json::Value>,
}

impl ObservedTurn {
    pub fn from_hook(actor: TurnActor, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            actor,
            text: text.into(),
            timestamp,
            timestamp_source: TimestampSource::Hook,
            entry_hash: None,
            is_internal: false,
            tool_input: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_round_trips() {
        for intent in TurnIntent::ALL {
            assert_eq!(TurnIntent::parse(intent.as_str()), Some(intent));
        }
    }

    #[test]
    fn legacy_end_of_task_is_accepted_never_emitted() {
        assert_eq!(TurnIntent::parse("end_of_task"), Some(TurnIntent::EndOfCommand));
        let parsed: TurnIntent = serde_json::from_str("\"end_of_task\"").unwrap();
        assert_eq!(parsed, TurnIntent::EndOfCommand);
        assert_eq!(
            serde_json::to_string(&TurnIntent::EndOfCommand).unwrap(),
            "\"end_of_command\""
        );
    }

    #[test]
    fn actor_parse_rejects_unknown() {
        assert_eq!(TurnActor::parse("assistant"), None);
    }
}
