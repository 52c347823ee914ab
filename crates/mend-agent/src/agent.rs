//! The agent control loop.
//!
//! One turn at a time: a user message is sent to the model, tool uses are
//! dispatched in emitted order, results are fed back, and the cascade
//! repeats until the model stops calling tools, the budget runs out, or
//! the turn is cancelled. Every observable step is appended to the
//! message log; every state change to the state-transition log.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mend_core::{
    AgentConfig, AgentMessage, AgentState, Budget, CumulativeUsage, MendError, MessageKind, Port,
    Result,
};
use mend_llm::{ChatMessage, Conversation, LlmService, Role, ToolContext, ToolEvent};
use mend_review::{CodeReviewer, GitExecutor};
use mend_tools::registry::{base_tools, RegistryOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::commits::CommitDetector;
use crate::done::make_done_tool;
use crate::fanout::{MessageIterator, MessageLog, StateIterator, StateLog};
use crate::port_monitor::PortMonitor;

const SYSTEM_PROMPT: &str = "\
You are an expert software engineer working autonomously in a git
checkout. You have shell, patch, think, keyword_search, codereview, and
done tools.

Work iteratively: inspect the repository, make changes, and run tests.
Commit your work with git as you go; write focused commit messages.
Before calling done, run the codereview tool on your latest commit and
address any regressions it reports. Use slow_ok=true for builds, tests,
downloads, and other substantive commands.";

/// History compaction kicks in above this many bytes of conversation.
const COMPACT_THRESHOLD: usize = 512 * 1024;

/// The interface the HTTP control plane and terminal UI consume.
pub trait CodingAgent: Send + Sync {
    fn messages(&self, start: usize, end: usize) -> Vec<AgentMessage>;
    fn message_count(&self) -> usize;
    fn new_iterator(&self, start_idx: usize) -> MessageIterator;
    fn new_state_iterator(&self) -> StateIterator;
    fn current_state(&self) -> AgentState;
    /// Enqueue a user message; it starts a turn when the agent is idle.
    fn user_message(&self, text: String);
    fn cancel_turn(&self, cause: String);
    fn cancel_tool_use(&self, id: &str, cause: &str) -> Result<()>;
    fn total_usage(&self) -> CumulativeUsage;
    fn original_budget(&self) -> Budget;
    fn working_dir(&self) -> PathBuf;
    fn session_id(&self) -> String;
    fn initial_commit(&self) -> String;
    fn branch_prefix(&self) -> String;
    fn open_ports(&self) -> Vec<Port>;
    fn outstanding_tool_calls(&self) -> Vec<String>;
    /// Compact history; returns bytes removed.
    fn compact_conversation(&self) -> usize;
}

enum TurnOutcome {
    Completed(String),
    BudgetExceeded(String),
}

pub struct Agent {
    config: AgentConfig,
    initial_commit: String,
    convo: Arc<Conversation>,
    log: Arc<MessageLog>,
    state_log: Arc<StateLog>,
    reviewer: Arc<CodeReviewer>,
    commits: CommitDetector,
    port_monitor: Arc<PortMonitor>,
    inbox_tx: mpsc::UnboundedSender<String>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    turn_cancel: Mutex<Option<CancellationToken>>,
    start_time: Instant,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        initial_commit: impl Into<String>,
        service: Arc<dyn LlmService>,
        git: Arc<dyn GitExecutor>,
        registry_opts: RegistryOptions,
    ) -> Arc<Self> {
        let initial_commit = initial_commit.into();
        let log = MessageLog::new();
        let state_log = StateLog::new();

        let convo = Conversation::new(service);
        convo.set_system_prompt(SYSTEM_PROMPT);

        let reviewer = Arc::new(CodeReviewer::new(git.clone(), initial_commit.clone()));
        let (mut tools, _installer) = base_tools(registry_opts);
        tools.push(reviewer.tool());
        tools.push(make_done_tool(reviewer.clone()));
        convo.set_tools(tools);

        // Tool activity flows into the message log as it happens.
        let sink_log = log.clone();
        let root_id = convo.id().to_string();
        convo.set_tool_event_sink(Arc::new(move |event: ToolEvent| {
            let msg = match event {
                ToolEvent::Use {
                    conversation_id,
                    parent_conversation_id,
                    tool_use_id,
                    name,
                    input,
                } => {
                    let mut m = AgentMessage::new(MessageKind::ToolUse, String::new());
                    m.parent_conversation_id =
                        (conversation_id != root_id).then_some(parent_conversation_id).flatten();
                    m.tool_name = Some(name);
                    m.tool_input = Some(input.to_string());
                    m.tool_use_id = Some(tool_use_id);
                    m
                }
                ToolEvent::Result {
                    conversation_id,
                    parent_conversation_id,
                    tool_use_id,
                    name,
                    content,
                    is_error,
                } => {
                    let mut m = AgentMessage::new(MessageKind::ToolResult, String::new());
                    m.parent_conversation_id =
                        (conversation_id != root_id).then_some(parent_conversation_id).flatten();
                    m.tool_name = Some(name);
                    m.tool_result = Some(content);
                    m.tool_error = is_error;
                    m.tool_use_id = Some(tool_use_id);
                    m
                }
            };
            sink_log.append(msg);
        }));

        let commits = CommitDetector::new(
            git.clone(),
            initial_commit.clone(),
            config.branch_prefix.clone(),
        );
        let port_monitor = PortMonitor::new(log.clone(), std::time::Duration::ZERO);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            config,
            initial_commit,
            convo,
            log,
            state_log,
            reviewer,
            commits,
            port_monitor,
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            turn_cancel: Mutex::new(None),
            start_time: Instant::now(),
        })
    }

    pub fn reviewer(&self) -> Arc<CodeReviewer> {
        self.reviewer.clone()
    }

    pub fn port_monitor(&self) -> Arc<PortMonitor> {
        self.port_monitor.clone()
    }

    pub fn message_log(&self) -> Arc<MessageLog> {
        self.log.clone()
    }

    /// The main loop: waits for user messages and runs one turn at a
    /// time until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(session = %self.config.session_id, "agent loop started");
        loop {
            let text = {
                let mut inbox = self.inbox_rx.lock().await;
                tokio::select! {
                    text = inbox.recv() => text,
                    _ = shutdown.cancelled() => None,
                }
            };
            let Some(text) = text else {
                break;
            };
            self.process_turn(text).await;
        }
        self.port_monitor.stop();
        info!("agent loop stopped");
    }

    async fn process_turn(&self, text: String) {
        self.log.append(AgentMessage::new(MessageKind::User, text.clone()));

        let token = CancellationToken::new();
        *self.turn_cancel.lock().unwrap() = Some(token.clone());
        let outcome = self.turn_loop(text, &token).await;
        *self.turn_cancel.lock().unwrap() = None;

        match outcome {
            Ok(TurnOutcome::Completed(final_text)) => {
                // Commits land before the turn's end-of-turn marker.
                self.emit_commits().await;
                self.log.append(
                    AgentMessage::new(MessageKind::Agent, final_text).with_end_of_turn(true),
                );
                self.state_log.transition(AgentState::EndOfTurn, "turn complete");
            }
            Ok(TurnOutcome::BudgetExceeded(reason)) => {
                self.emit_commits().await;
                self.log.append(
                    AgentMessage::new(MessageKind::Budget, reason).with_end_of_turn(true),
                );
                self.state_log.transition(AgentState::EndOfTurn, "budget exceeded");
            }
            Err(e) if e.is_cancelled() => {
                // History is preserved; outstanding tool uses were
                // cancelled when the turn was.
                self.convo.cancel_all_tool_uses("turn cancelled");
                self.log.append(
                    AgentMessage::new(MessageKind::Error, format!("turn cancelled: {e}"))
                        .with_end_of_turn(true),
                );
                self.state_log.transition(AgentState::Cancelled, "turn cancelled");
            }
            Err(e) => {
                error!(error = %e, "turn failed");
                self.log.append(
                    AgentMessage::new(MessageKind::Error, e.to_string()).with_end_of_turn(true),
                );
                self.state_log.transition(AgentState::Error, "fatal error");
            }
        }
        self.state_log.transition(AgentState::Idle, "ready");
    }

    async fn turn_loop(&self, text: String, token: &CancellationToken) -> Result<TurnOutcome> {
        self.state_log.transition(AgentState::SendingToLlm, "user message");
        let mut resp = self.convo.send_user_text(text).await?;

        loop {
            self.sync_wall_time();
            if let Some(reason) = self.config.budget.exceeded(&self.convo.usage()) {
                return Ok(TurnOutcome::BudgetExceeded(reason));
            }
            if token.is_cancelled() {
                return Err(MendError::Cancelled("turn cancelled".to_string()));
            }

            let tool_use_count = resp.tool_uses().count();
            if tool_use_count == 0 {
                self.maybe_compact();
                return Ok(TurnOutcome::Completed(resp.text()));
            }

            // Text the model produced alongside its tool calls.
            let interim = resp.text();
            if !interim.trim().is_empty() {
                self.log.append(AgentMessage::new(MessageKind::Agent, interim));
            }

            self.state_log.transition(
                AgentState::AwaitingTools,
                format!("{tool_use_count} tool uses"),
            );
            let ctx = ToolContext {
                working_dir: self.config.working_dir.clone(),
                cancel: token.clone(),
                convo: None,
            };
            let results = self.convo.tool_result_contents(&ctx, &resp).await?;
            if token.is_cancelled() {
                return Err(MendError::Cancelled("turn cancelled".to_string()));
            }

            self.state_log.transition(AgentState::SendingToLlm, "tool results");
            resp = self
                .convo
                .send_message(ChatMessage {
                    role: Role::User,
                    content: results,
                })
                .await?;
        }
    }

    async fn emit_commits(&self) {
        match self.commits.detect_new_commits().await {
            Ok(commits) if !commits.is_empty() => {
                let mut msg = AgentMessage::new(
                    MessageKind::Commit,
                    format!("{} new commit(s)", commits.len()),
                );
                msg.commits = commits;
                self.log.append(msg);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "commit detection failed");
            }
        }
    }

    fn sync_wall_time(&self) {
        let usage = self.convo.usage_handle();
        usage.lock().unwrap().wall_time = self.start_time.elapsed();
    }

    fn maybe_compact(&self) {
        if self.convo.history_size() <= COMPACT_THRESHOLD {
            return;
        }
        let bytes = self.convo.compact();
        if bytes > 0 {
            self.log.append(AgentMessage::new(
                MessageKind::System,
                format!("conversation compacted: {bytes} bytes removed"),
            ));
        }
    }
}

impl CodingAgent for Agent {
    fn messages(&self, start: usize, end: usize) -> Vec<AgentMessage> {
        self.log.messages(start, end)
    }

    fn message_count(&self) -> usize {
        self.log.len()
    }

    fn new_iterator(&self, start_idx: usize) -> MessageIterator {
        self.log.iter(start_idx)
    }

    fn new_state_iterator(&self) -> StateIterator {
        self.state_log.iter()
    }

    fn current_state(&self) -> AgentState {
        self.state_log.current()
    }

    fn user_message(&self, text: String) {
        let _ = self.inbox_tx.send(text);
    }

    fn cancel_turn(&self, cause: String) {
        if let Some(token) = self.turn_cancel.lock().unwrap().clone() {
            info!(cause = %cause, "cancelling turn");
            token.cancel();
        }
        // Outstanding tool uses are cancelled immediately so the map is
        // empty by the time this returns.
        self.convo.cancel_all_tool_uses(&cause);
    }

    fn cancel_tool_use(&self, id: &str, cause: &str) -> Result<()> {
        self.convo.cancel_tool_use(id, cause)
    }

    fn total_usage(&self) -> CumulativeUsage {
        self.sync_wall_time();
        self.convo.usage()
    }

    fn original_budget(&self) -> Budget {
        self.config.budget.clone()
    }

    fn working_dir(&self) -> PathBuf {
        self.config.working_dir.clone()
    }

    fn session_id(&self) -> String {
        self.config.session_id.clone()
    }

    fn initial_commit(&self) -> String {
        self.initial_commit.clone()
    }

    fn branch_prefix(&self) -> String {
        self.config.branch_prefix.clone()
    }

    fn open_ports(&self) -> Vec<Port> {
        self.port_monitor.ports()
    }

    fn outstanding_tool_calls(&self) -> Vec<String> {
        self.convo.outstanding_tool_calls()
    }

    fn compact_conversation(&self) -> usize {
        let bytes = self.convo.compact();
        self.log.append(AgentMessage::new(
            MessageKind::System,
            format!("conversation compacted: {bytes} bytes removed"),
        ));
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_llm::MockService;
    use mend_review::MockGit;
    use serde_json::json;
    use std::time::Duration;

    fn quiet_git() -> MockGit {
        let git = MockGit::new("/repo");
        git.respond("log --format=%H%x00%h%x00%s base000..HEAD", "", true);
        git
    }

    fn make_agent(service: MockService, budget: Budget) -> Arc<Agent> {
        let mut config = AgentConfig::new("/tmp", "test-session");
        config.budget = budget;
        Agent::new(
            config,
            "base000",
            Arc::new(service),
            Arc::new(quiet_git()),
            RegistryOptions::default(),
        )
    }

    async fn drive_one_turn(agent: &Arc<Agent>, text: &str) -> Vec<AgentMessage> {
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(agent.clone().run(shutdown.clone()));

        let mut it = agent.new_iterator(0);
        agent.user_message(text.to_string());

        let mut messages = Vec::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), it.next())
                .await
                .expect("turn did not complete")
                .expect("log closed");
            let end = msg.end_of_turn;
            messages.push(msg);
            if end {
                break;
            }
        }
        shutdown.cancel();
        let _ = runner.await;
        messages
    }

    #[tokio::test]
    async fn simple_turn_appends_user_then_agent() {
        let service = MockService::new(vec![MockService::text_response("hi there")]);
        let agent = make_agent(service, Budget::default());
        let messages = drive_one_turn(&agent, "hello").await;

        assert_eq!(messages[0].kind, MessageKind::User);
        assert_eq!(messages[0].content, "hello");
        let last = messages.last().unwrap();
        assert_eq!(last.kind, MessageKind::Agent);
        assert_eq!(last.content, "hi there");
        assert!(last.end_of_turn);

        // Contiguous indexes from zero.
        for (i, m) in messages.iter().enumerate() {
            assert_eq!(m.idx, i);
        }

        // The state log saw the full cycle and rests at idle.
        let states: Vec<AgentState> = agent
            .state_log
            .transitions()
            .iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(
            states,
            vec![AgentState::SendingToLlm, AgentState::EndOfTurn, AgentState::Idle]
        );
        assert_eq!(agent.current_state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn tool_cascade_emits_use_and_result_in_order() {
        let service = MockService::new(vec![
            MockService::tool_use_response("t1", "think", json!({"thoughts": "plan the fix"})),
            MockService::text_response("all done"),
        ]);
        let agent = make_agent(service, Budget::default());
        let messages = drive_one_turn(&agent, "fix it").await;

        let kinds: Vec<MessageKind> = messages.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::User,
                MessageKind::ToolUse,
                MessageKind::ToolResult,
                MessageKind::Agent
            ]
        );
        assert_eq!(messages[1].tool_name.as_deref(), Some("think"));
        assert!(messages[1].tool_input.as_deref().unwrap().contains("plan the fix"));
        assert_eq!(messages[2].tool_result.as_deref(), Some("recorded"));
        assert!(!messages[2].tool_error);
        assert!(messages[3].end_of_turn);
    }

    #[tokio::test]
    async fn tool_error_flows_back_as_error_result() {
        let service = MockService::new(vec![
            MockService::tool_use_response("t1", "no_such_tool", json!({})),
            MockService::text_response("recovered"),
        ]);
        let agent = make_agent(service, Budget::default());
        let messages = drive_one_turn(&agent, "go").await;
        let result = messages
            .iter()
            .find(|m| m.kind == MessageKind::ToolResult)
            .unwrap();
        assert!(result.tool_error);
        assert!(result.tool_result.as_deref().unwrap().contains("unknown tool"));
        // The turn still completed normally.
        assert_eq!(messages.last().unwrap().content, "recovered");
    }

    #[tokio::test]
    async fn budget_exhaustion_ends_turn_with_budget_message() {
        let service = MockService::new(vec![
            MockService::tool_use_response("t1", "think", json!({"thoughts": "x"})),
            MockService::text_response("never reached"),
        ]);
        let budget = Budget {
            max_responses: 1,
            ..Default::default()
        };
        let agent = make_agent(service, budget);
        let messages = drive_one_turn(&agent, "go").await;
        let last = messages.last().unwrap();
        assert_eq!(last.kind, MessageKind::Budget);
        assert!(last.content.contains("response limit"), "got: {}", last.content);
        assert!(last.end_of_turn);
    }

    #[tokio::test]
    async fn usage_is_monotonic_across_observations() {
        let service = MockService::new(vec![
            MockService::tool_use_response("t1", "think", json!({"thoughts": "x"})),
            MockService::text_response("done"),
        ]);
        let agent = make_agent(service, Budget::default());

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(agent.clone().run(shutdown.clone()));
        let mut it = agent.new_iterator(0);
        agent.user_message("go".to_string());

        let mut prev = agent.total_usage();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), it.next())
                .await
                .unwrap()
                .unwrap();
            let now = agent.total_usage();
            assert!(now.responses >= prev.responses);
            assert!(now.input_tokens >= prev.input_tokens);
            assert!(now.output_tokens >= prev.output_tokens);
            assert!(now.total_cost_usd >= prev.total_cost_usd);
            assert!(now.wall_time >= prev.wall_time);
            prev = now;
            if msg.end_of_turn {
                break;
            }
        }
        shutdown.cancel();
        let _ = runner.await;
    }

    #[tokio::test]
    async fn cancel_turn_empties_outstanding_and_returns_to_idle() {
        // A tool that never finishes on its own.
        let service = MockService::new(vec![MockService::tool_use_response(
            "t1",
            "shell",
            json!({"command": "sleep 30"}),
        )]);
        let agent = make_agent(service, Budget::default());

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(agent.clone().run(shutdown.clone()));
        let mut it = agent.new_iterator(0);
        agent.user_message("hang".to_string());

        // Wait until the shell tool is in flight.
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), it.next())
                .await
                .unwrap()
                .unwrap();
            if msg.kind == MessageKind::ToolUse {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        agent.cancel_turn("user canceled the operation".to_string());
        assert!(agent.outstanding_tool_calls().is_empty());

        // The turn winds down with an end-of-turn message.
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), it.next())
                .await
                .unwrap()
                .unwrap();
            if msg.end_of_turn {
                break;
            }
        }
        shutdown.cancel();
        let _ = runner.await;
    }

    #[tokio::test]
    async fn queued_messages_run_as_separate_turns() {
        let service = MockService::new(vec![
            MockService::text_response("first answer"),
            MockService::text_response("second answer"),
        ]);
        let agent = make_agent(service, Budget::default());
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(agent.clone().run(shutdown.clone()));
        let mut it = agent.new_iterator(0);
        agent.user_message("one".to_string());
        agent.user_message("two".to_string());

        let mut end_of_turns = 0;
        while end_of_turns < 2 {
            let msg = tokio::time::timeout(Duration::from_secs(5), it.next())
                .await
                .unwrap()
                .unwrap();
            if msg.end_of_turn {
                end_of_turns += 1;
            }
        }
        let contents: Vec<String> = agent
            .messages(0, agent.message_count())
            .into_iter()
            .filter(|m| m.kind == MessageKind::Agent)
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["first answer", "second answer"]);
        shutdown.cancel();
        let _ = runner.await;
    }
}
