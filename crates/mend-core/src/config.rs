//! Agent configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::types::Budget;

pub const DEFAULT_FAST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SLOW_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_BACKGROUND_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Environment variable set on every agent-spawned child process.
pub const AGENT_MARKER_ENV: &str = "MEND";
/// Environment variable marking processes whose ports the monitor ignores.
pub const IGNORE_PORTS_ENV: &str = "MEND_IGNORE_PORTS";

/// Static configuration for one agent session.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Working directory for tool execution. Always the repo checkout.
    pub working_dir: PathBuf,
    /// Repository root (usually equal to working_dir).
    pub repo_root: PathBuf,
    pub session_id: String,
    pub model: String,
    /// Prefix for branches the agent pushes, e.g. "mend/".
    pub branch_prefix: String,
    pub budget: Budget,
    pub timeouts: Timeouts,
}

impl AgentConfig {
    pub fn new(working_dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        let working_dir = working_dir.into();
        Self {
            repo_root: working_dir.clone(),
            working_dir,
            session_id: session_id.into(),
            model: "claude-sonnet-4-20250514".to_string(),
            branch_prefix: "mend/".to_string(),
            budget: Budget::default(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Configurable timeout tiers for shell commands.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Regular commands (ls, echo, simple scripts).
    pub fast: Duration,
    /// Commands that may reasonably take longer (builds, downloads, tests).
    pub slow: Duration,
    /// Background commands (servers, long-running processes).
    pub background: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fast: DEFAULT_FAST_TIMEOUT,
            slow: DEFAULT_SLOW_TIMEOUT,
            background: DEFAULT_BACKGROUND_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts() {
        let t = Timeouts::default();
        assert_eq!(t.fast, Duration::from_secs(30));
        assert_eq!(t.slow, Duration::from_secs(900));
        assert_eq!(t.background, Duration::from_secs(86_400));
    }
}
