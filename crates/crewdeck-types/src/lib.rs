mod event;
mod hook;
mod state;
mod turn;

pub use event::*;
pub use hook::*;
pub use state::*;
pub use turn::*;

/// Numeric row id of a project.
pub type ProjectId = i64;
/// Numeric row id of an agent.
pub type AgentId = i64;
/// Numeric row id of a command.
pub type CommandId = i64;
/// Numeric row id of a turn.
pub type TurnId = i64;
/// Numeric row id of a persisted event.
pub type EventId = i64;
