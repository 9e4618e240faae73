use serde::{Deserialize, Serialize};

/// Persistent state of a command.
///
/// `Complete` is terminal: no intent can revive a completed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Idle,
    Commanded,
    Processing,
    AwaitingInput,
    Complete,
}

impl CommandState {
    /// Storage representation (lowercase snake).
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Idle => "idle",
            CommandState::Commanded => "commanded",
            CommandState::Processing => "processing",
            CommandState::AwaitingInput => "awaiting_input",
            CommandState::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(CommandState::Idle),
            "commanded" => Some(CommandState::Commanded),
            "processing" => Some(CommandState::Processing),
            "awaiting_input" => Some(CommandState::AwaitingInput),
            "complete" => Some(CommandState::Complete),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Complete)
    }

    /// A command that still accepts transitions.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub const ALL: [CommandState; 5] = [
        CommandState::Idle,
        CommandState::Commanded,
        CommandState::Processing,
        CommandState::AwaitingInput,
        CommandState::Complete,
    ];
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally-visible state of an agent card.
///
/// `TimedOut` is derived, never stored: the current command is `Processing`
/// but the last turn is older than the configured staleness threshold.
/// Cards cross the wire as strings, never as enum discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardState {
    Idle,
    Commanded,
    Processing,
    AwaitingInput,
    Complete,
    TimedOut,
}

impl CardState {
    /// Wire representation (uppercase snake).
    pub fn as_str(&self) -> &'static str {
        match self {
            CardState::Idle => "IDLE",
            CardState::Commanded => "COMMANDED",
            CardState::Processing => "PROCESSING",
            CardState::AwaitingInput => "AWAITING_INPUT",
            CardState::Complete => "COMPLETE",
            CardState::TimedOut => "TIMED_OUT",
        }
    }
}

impl From<CommandState> for CardState {
    fn from(state: CommandState) -> Self {
        match state {
            CommandState::Idle => CardState::Idle,
            CommandState::Commanded => CardState::Commanded,
            CommandState::Processing => CardState::Processing,
            CommandState::AwaitingInput => CardState::AwaitingInput,
            CommandState::Complete => CardState::Complete,
        }
    }
}

impl std::fmt::Display for CardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaStatus {
    Active,
    Archived,
}

impl PersonaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersonaStatus::Active => "active",
            PersonaStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PersonaStatus::Active),
            "archived" => Some(PersonaStatus::Archived),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_state_round_trips_through_storage_form() {
        for state in CommandState::ALL {
            assert_eq!(CommandState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn unknown_state_string_is_rejected() {
        assert_eq!(CommandState::parse("COMPLETE"), None);
        assert_eq!(CommandState::parse(""), None);
    }

    #[test]
    fn only_complete_is_terminal() {
        assert!(CommandState::Complete.is_terminal());
        for state in [
            CommandState::Idle,
            CommandState::Commanded,
            CommandState::Processing,
            CommandState::AwaitingInput,
        ] {
            assert!(state.is_live(), "{state} should accept transitions");
        }
    }

    #[test]
    fn card_state_serialises_as_uppercase_string() {
        let json = serde_json::to_string(&CardState::AwaitingInput).unwrap();
        assert_eq!(json, "\"AWAITING_INPUT\"");
        assert_eq!(CardState::TimedOut.as_str(), "TIMED_OUT");
    }

    #[test]
    fn card_state_from_command_state_preserves_meaning() {
        assert_eq!(CardState::from(CommandState::Processing).as_str(), "PROCESSING");
        assert_eq!(CardState::from(CommandState::Idle).as_str(), "IDLE");
    }
}
