//! Core type definitions shared across the mend workspace.

pub mod config;
pub mod error;
pub mod types;

pub use config::AgentConfig;
pub use error::{MendError, Result};
pub use types::{
    AgentMessage, AgentState, Budget, Commit, CumulativeUsage, MessageKind, Port, StateTransition,
};
