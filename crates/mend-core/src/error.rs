//! Unified error types for mend

use thiserror::Error;

/// Unified error type for all mend operations
#[derive(Error, Debug)]
pub enum MendError {
    // Git errors
    #[error("git command failed: {0}")]
    GitCommand(String),

    #[error("git state error: {0}")]
    GitState(String),

    // LLM errors
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM rate limit: {0}")]
    LlmRateLimit(String),

    // Tool errors
    #[error("tool error: {0}")]
    Tool(String),

    #[error("invalid tool input: {0}")]
    ToolInput(String),

    #[error("command refused: {0}")]
    CommandRefused(String),

    // Agent errors
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("agent error: {0}")]
    Agent(String),

    // Review errors
    #[error("review error: {0}")]
    Review(String),

    // Configuration errors
    #[error("config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl MendError {
    /// True for errors that represent a cancelled context rather than a
    /// real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MendError::Cancelled(_))
    }
}

/// Result type alias using MendError
pub type Result<T> = std::result::Result<T, MendError>;
