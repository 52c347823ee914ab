//! Core type definitions for the mend agent

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of an entry in the agent's append-only message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Agent,
    ToolUse,
    ToolResult,
    Error,
    Budget,
    Auto,
    Commit,
    System,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::ToolUse => write!(f, "tool_use"),
            Self::ToolResult => write!(f, "tool_result"),
            Self::Error => write!(f, "error"),
            Self::Budget => write!(f, "budget"),
            Self::Auto => write!(f, "auto"),
            Self::Commit => write!(f, "commit"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A commit produced during the session, detected after tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub short_hash: String,
    pub subject: String,
    /// Branch name this commit was pushed to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pushed_branch: Option<String>,
}

/// One entry in the append-only message log.
///
/// Once appended, fields are immutable and the index is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub idx: usize,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set for messages originating in a sub-conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// JSON-encoded tool input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub tool_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub end_of_turn: bool,
    #[serde(default)]
    pub hide_output: bool,
}

impl AgentMessage {
    /// A message of the given kind with content; the index is assigned by
    /// the message log at append time.
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            idx: 0,
            kind,
            content: content.into(),
            timestamp: Utc::now(),
            parent_conversation_id: None,
            tool_name: None,
            tool_input: None,
            tool_result: None,
            tool_use_id: None,
            tool_error: false,
            commits: Vec::new(),
            end_of_turn: false,
            hide_output: false,
        }
    }

    pub fn with_end_of_turn(mut self, end_of_turn: bool) -> Self {
        self.end_of_turn = end_of_turn;
        self
    }
}

/// Per-turn spending limits. A zero value means "unlimited" on that axis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Budget {
    pub max_responses: u64,
    #[serde(with = "duration_secs")]
    pub max_wall_time: Duration,
    pub max_dollars: f64,
}

impl Budget {
    /// Returns a human-readable description of the first exhausted axis,
    /// or None when the usage is still within budget.
    pub fn exceeded(&self, usage: &CumulativeUsage) -> Option<String> {
        if self.max_responses > 0 && usage.responses >= self.max_responses {
            return Some(format!(
                "response limit reached: {} of {}",
                usage.responses, self.max_responses
            ));
        }
        if !self.max_wall_time.is_zero() && usage.wall_time >= self.max_wall_time {
            return Some(format!(
                "wall time limit reached: {:?} of {:?}",
                usage.wall_time, self.max_wall_time
            ));
        }
        if self.max_dollars > 0.0 && usage.total_cost_usd >= self.max_dollars {
            return Some(format!(
                "cost limit reached: ${:.2} of ${:.2}",
                usage.total_cost_usd, self.max_dollars
            ));
        }
        None
    }
}

/// Token and cost accounting, cumulative over a run.
///
/// All fields are monotonically non-decreasing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CumulativeUsage {
    pub input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub output_tokens: u64,
    pub responses: u64,
    #[serde(with = "duration_secs")]
    pub wall_time: Duration,
    pub total_cost_usd: f64,
}

impl CumulativeUsage {
    pub fn total_input_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Agent control loop state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    WaitingForUser,
    SendingToLlm,
    AwaitingTools,
    EndOfTurn,
    Error,
    Cancelled,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::WaitingForUser => write!(f, "waiting_for_user"),
            Self::SendingToLlm => write!(f, "sending_to_llm"),
            Self::AwaitingTools => write!(f, "awaiting_tools"),
            Self::EndOfTurn => write!(f, "end_of_turn"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One recorded state transition of the agent control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: AgentState,
    pub to: AgentState,
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(from: AgentState, to: AgentState, event: impl Into<String>) -> Self {
        Self {
            from,
            to,
            event: event.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A listening socket observed by the port monitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    pub proto: String,
    pub port: u16,
    pub pid: i32,
    pub process: String,
}
