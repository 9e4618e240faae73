pub mod card;
pub mod correlator;
pub mod oracle;
pub mod priority;
pub mod receiver;
pub mod sanitiser;
pub mod state_machine;
pub mod summary;

pub use card::{AgentCard, CardProjector};
pub use correlator::{Correlator, CorrelatorConfig, ProcessOutcome};
pub use oracle::{CachingOracle, Oracle, OracleError};
pub use priority::PriorityScorer;
pub use receiver::{HookOutcome, HookPipeline, HookReceiverState};
pub use sanitiser::{contains_error_patterns, sanitise_error_output};
pub use state_machine::{TransitionResult, validate};
pub use summary::Summariser;
