use crewdeck_types::{CommandState, TurnActor, TurnIntent};

/// Verdict of the pure transition function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub valid: bool,
    pub to_state: Option<CommandState>,
    pub reason: Option<&'static str>,
    pub trigger: &'static str,
}

impl TransitionResult {
    fn transition(to_state: CommandState, trigger: &'static str) -> Self {
        Self {
            valid: true,
            to_state: Some(to_state),
            reason: None,
            trigger,
        }
    }

    fn rejected(reason: &'static str, trigger: &'static str) -> Self {
        Self {
            valid: false,
            to_state: None,
            reason: Some(reason),
            trigger,
        }
    }

    /// The correlator branches to its new-sibling-command path on this.
    pub fn wants_new_command(&self) -> bool {
        self.reason == Some(REASON_NEW_COMMAND)
    }
}

pub const REASON_NEW_COMMAND: &str = "should create new command";
pub const REASON_NO_TRANSITION: &str = "no transition defined";
pub const REASON_TERMINAL: &str = "command is complete";

/// Pure, total transition table over `(state, actor, intent)`.
///
/// Every cell of the 5 x 2 x 6 product is either a transition or an explicit
/// rejection; callers turn rejections into no-ops with audit events.
/// `Complete` is terminal: no intent leaves it.
pub fn validate(from: CommandState, actor: TurnActor, intent: TurnIntent) -> TransitionResult {
    use CommandState::*;
    use TurnActor::*;
    use TurnIntent::*;

    let trigger = trigger_name(actor, intent);

    if from == Complete {
        // A fresh user command on a completed agent opens a new command; the
        // completed one itself never changes.
        if actor == User && intent == Command {
            return TransitionResult::rejected(REASON_NEW_COMMAND, trigger);
        }
        return TransitionResult::rejected(REASON_TERMINAL, trigger);
    }

    match (from, actor, intent) {
        (Idle, User, Command) => TransitionResult::transition(Commanded, trigger),
        // Double-prompting: the live command keeps its state and a sibling
        // command is opened for the new prompt.
        (Commanded | Processing | AwaitingInput, User, Command) => {
            TransitionResult::rejected(REASON_NEW_COMMAND, trigger)
        }

        (AwaitingInput, User, Answer) => TransitionResult::transition(Processing, trigger),

        (Commanded, Agent, Progress) => TransitionResult::transition(Processing, trigger),
        (Processing, Agent, Progress) => TransitionResult::transition(Processing, trigger),

        (Commanded | Processing, Agent, Question) => {
            TransitionResult::transition(AwaitingInput, trigger)
        }

        (Commanded | Processing, Agent, Completion) => {
            TransitionResult::transition(Complete, trigger)
        }
        (Commanded | Processing, Agent, EndOfCommand) => {
            TransitionResult::transition(Complete, trigger)
        }

        _ => TransitionResult::rejected(REASON_NO_TRANSITION, trigger),
    }
}

fn trigger_name(actor: TurnActor, intent: TurnIntent) -> &'static str {
    use TurnActor::*;
    use TurnIntent::*;
    match (actor, intent) {
        (User, Command) => "user_command",
        (User, Answer) => "user_answer",
        (User, Question) => "user_question",
        (User, Completion) => "user_completion",
        (User, Progress) => "user_progress",
        (User, EndOfCommand) => "user_end_of_command",
        (Agent, Command) => "agent_command",
        (Agent, Answer) => "agent_answer",
        (Agent, Question) => "agent_question",
        (Agent, Completion) => "agent_completion",
        (Agent, Progress) => "agent_progress",
        (Agent, EndOfCommand) => "agent_end_of_command",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandState::*;
    use TurnActor::*;
    use TurnIntent::*;

    #[test]
    fn validate_is_pure() {
        let a = validate(Processing, Agent, Question);
        let b = validate(Processing, Agent, Question);
        assert_eq!(a, b);
    }

    #[test]
    fn user_command_from_idle_opens_commanded() {
        let result = validate(Idle, User, Command);
        assert!(result.valid);
        assert_eq!(result.to_state, Some(Commanded));
        assert_eq!(result.trigger, "user_command");
    }

    #[test]
    fn user_command_on_live_command_steers_to_sibling() {
        for from in [Commanded, Processing, AwaitingInput] {
            let result = validate(from, User, Command);
            assert!(!result.valid);
            assert!(result.wants_new_command(), "from {from}");
        }
    }

    #[test]
    fn user_answer_resumes_processing_only_from_awaiting_input() {
        let result = validate(AwaitingInput, User, Answer);
        assert!(result.valid);
        assert_eq!(result.to_state, Some(Processing));

        for from in [Idle, Commanded, Processing] {
            assert!(!validate(from, User, Answer).valid, "from {from}");
        }
    }

    #[test]
    fn agent_progress_self_loops_in_processing() {
        let from_commanded = validate(Commanded, Agent, Progress);
        assert_eq!(from_commanded.to_state, Some(Processing));

        let self_loop = validate(Processing, Agent, Progress);
        assert!(self_loop.valid);
        assert_eq!(self_loop.to_state, Some(Processing));
    }

    #[test]
    fn agent_question_parks_on_awaiting_input() {
        for from in [Commanded, Processing] {
            let result = validate(from, Agent, Question);
            assert_eq!(result.to_state, Some(AwaitingInput), "from {from}");
        }
        assert!(!validate(AwaitingInput, Agent, Question).valid);
    }

    #[test]
    fn completion_and_end_of_command_close_the_command() {
        for from in [Commanded, Processing] {
            for intent in [Completion, EndOfCommand] {
                let result = validate(from, Agent, intent);
                assert_eq!(result.to_state, Some(Complete), "from {from} via {intent}");
            }
        }
    }

    #[test]
    fn complete_is_terminal_for_every_actor_and_intent() {
        for actor in TurnActor::ALL {
            for intent in TurnIntent::ALL {
                let result = validate(Complete, actor, intent);
                assert!(!result.valid, "{actor}:{intent} must not leave COMPLETE");
                assert_eq!(result.to_state, None);
            }
        }
    }

    #[test]
    fn the_table_is_total() {
        // Every cell of the cartesian product yields a verdict with a
        // trigger; nothing panics, nothing is unclassified.
        for from in CommandState::ALL {
            for actor in TurnActor::ALL {
                for intent in TurnIntent::ALL {
                    let result = validate(from, actor, intent);
                    assert!(!result.trigger.is_empty());
                    if result.valid {
                        assert!(result.to_state.is_some());
                        assert!(result.reason.is_none());
                    } else {
                        assert!(result.to_state.is_none());
                        assert!(result.reason.is_some());
                    }
                }
            }
        }
    }

    #[test]
    fn exhaustive_valid_cell_census() {
        // The table admits exactly these transitions and no others.
        let mut valid_cells = Vec::new();
        for from in CommandState::ALL {
            for actor in TurnActor::ALL {
                for intent in TurnIntent::ALL {
                    if validate(from, actor, intent).valid {
                        valid_cells.push((from, actor, intent));
                    }
                }
            }
        }
        assert_eq!(
            valid_cells,
            vec![
                (Idle, User, Command),
                (Commanded, Agent, Question),
                (Commanded, Agent, Completion),
                (Commanded, Agent, Progress),
                (Commanded, Agent, EndOfCommand),
                (Processing, Agent, Question),
                (Processing, Agent, Completion),
                (Processing, Agent, Progress),
                (Processing, Agent, EndOfCommand),
                (AwaitingInput, User, Answer),
            ]
        );
    }
}
