pub mod context;
pub mod error;
pub mod send_lock;
pub mod tmux;

pub use context::{ContextUsage, parse_context_usage};
pub use error::{BridgeError, Result};
pub use send_lock::SendLockRegistry;
pub use tmux::{PaneHealth, PaneInfo, TmuxBridge, TmuxConfig};
