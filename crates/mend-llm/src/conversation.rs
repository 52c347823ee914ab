//! The conversation engine: history, tool dispatch, sub-conversations.
//!
//! A conversation owns its message history and its map of outstanding
//! tool-use cancel handles. Sub-conversations share the service and the
//! cumulative usage counters but have their own history, system prompt,
//! and tool set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mend_core::{CumulativeUsage, MendError, Result};
use serde_json::Value;
use tracing::debug;

use crate::content::{ChatMessage, ContentBlock};
use crate::service::{LlmService, Request, Response};
use crate::tool::{Tool, ToolContext};

/// Tool activity surfaced to observers (the agent's message log).
#[derive(Debug, Clone)]
pub enum ToolEvent {
    Use {
        conversation_id: String,
        parent_conversation_id: Option<String>,
        tool_use_id: String,
        name: String,
        input: Value,
    },
    Result {
        conversation_id: String,
        parent_conversation_id: Option<String>,
        tool_use_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
}

pub type ToolEventSink = Arc<dyn Fn(ToolEvent) + Send + Sync>;

/// Placeholder inserted by history compaction.
const COMPACTED_PLACEHOLDER: &str = "[old tool output removed to save space]";
/// Tool-result blocks larger than this are eligible for compaction.
const COMPACT_BLOCK_CUTOFF: usize = 2048;

pub struct Conversation {
    id: String,
    parent_id: Option<String>,
    service: Arc<dyn LlmService>,
    system_prompt: Mutex<String>,
    tools: Mutex<Vec<Tool>>,
    history: Mutex<Vec<ChatMessage>>,
    /// Outstanding tool-use id -> cancel handle.
    tool_use_cancel: Mutex<HashMap<String, tokio_util::sync::CancellationToken>>,
    /// Shared with sub-conversations.
    usage: Arc<Mutex<CumulativeUsage>>,
    tool_events: Mutex<Option<ToolEventSink>>,
    /// Hidden conversations emit no tool events.
    hidden: bool,
}

impl Conversation {
    pub fn new(service: Arc<dyn LlmService>) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            service,
            system_prompt: Mutex::new(String::new()),
            tools: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            tool_use_cancel: Mutex::new(HashMap::new()),
            usage: Arc::new(Mutex::new(CumulativeUsage::default())),
            tool_events: Mutex::new(None),
            hidden: false,
        })
    }

    /// A new conversation sharing this one's service and cumulative usage
    /// counters, with fresh history, system prompt, and tools.
    pub fn sub_conversation(&self, hidden: bool) -> Arc<Conversation> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: Some(self.id.clone()),
            service: self.service.clone(),
            system_prompt: Mutex::new(String::new()),
            tools: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            tool_use_cancel: Mutex::new(HashMap::new()),
            usage: self.usage.clone(),
            tool_events: Mutex::new(self.tool_events.lock().unwrap().clone()),
            hidden,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        *self.system_prompt.lock().unwrap() = prompt.into();
    }

    pub fn set_tools(&self, tools: Vec<Tool>) {
        *self.tools.lock().unwrap() = tools;
    }

    pub fn set_tool_event_sink(&self, sink: ToolEventSink) {
        *self.tool_events.lock().unwrap() = Some(sink);
    }

    pub fn usage(&self) -> CumulativeUsage {
        self.usage.lock().unwrap().clone()
    }

    pub fn usage_handle(&self) -> Arc<Mutex<CumulativeUsage>> {
        self.usage.clone()
    }

    pub fn outstanding_tool_calls(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tool_use_cancel.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn emit(&self, event: ToolEvent) {
        if self.hidden {
            return;
        }
        let sink = self.tool_events.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    /// Append a user text message and get the next assistant response.
    pub async fn send_user_text(&self, text: impl Into<String>) -> Result<Response> {
        self.send_message(ChatMessage::user_text(text)).await
    }

    /// Append a message, call the model, and append its response.
    ///
    /// Callers are expected to send serially; the engine protects its
    /// state but does not order concurrent senders.
    pub async fn send_message(&self, msg: ChatMessage) -> Result<Response> {
        let req = {
            let mut history = self.history.lock().unwrap();
            history.push(msg);
            Request {
                system: self.system_prompt.lock().unwrap().clone(),
                messages: history.clone(),
                tools: self
                    .tools
                    .lock()
                    .unwrap()
                    .iter()
                    .map(Tool::descriptor)
                    .collect(),
                tool_choice: None,
            }
        };

        let resp = self.service.complete(&req).await?;

        self.history.lock().unwrap().push(ChatMessage {
            role: resp.role,
            content: resp.content.clone(),
        });

        {
            let mut usage = self.usage.lock().unwrap();
            usage.responses += 1;
            usage.input_tokens += resp.usage.input_tokens;
            usage.output_tokens += resp.usage.output_tokens;
            usage.cache_read_input_tokens += resp.usage.cache_read_input_tokens;
            usage.cache_creation_input_tokens += resp.usage.cache_creation_input_tokens;
            usage.total_cost_usd += resp.cost_usd;
        }

        Ok(resp)
    }

    /// Run every tool use in `resp`, in the order the model emitted them,
    /// and return the corresponding tool-result blocks in that order.
    ///
    /// Tool failures become result blocks with `is_error`; the model
    /// decides whether to recover. Cancellation of an individual tool use
    /// (via [`Conversation::cancel_tool_use`]) affects only that runner.
    pub async fn tool_result_contents(
        self: &Arc<Self>,
        ctx: &ToolContext,
        resp: &Response,
    ) -> Result<Vec<ContentBlock>> {
        let mut results = Vec::new();
        for block in &resp.content {
            let ContentBlock::ToolUse { id, name, input } = block else {
                continue;
            };
            self.emit(ToolEvent::Use {
                conversation_id: self.id.clone(),
                parent_conversation_id: self.parent_id.clone(),
                tool_use_id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            });

            let tool = {
                let tools = self.tools.lock().unwrap();
                tools.iter().find(|t| t.name == *name).cloned()
            };

            let outcome = match tool {
                None => Err(MendError::Tool(format!("unknown tool: {name}"))),
                Some(tool) => {
                    let token = ctx.cancel.child_token();
                    self.tool_use_cancel
                        .lock()
                        .unwrap()
                        .insert(id.clone(), token.clone());
                    let tool_ctx = ToolContext {
                        working_dir: ctx.working_dir.clone(),
                        cancel: token,
                        convo: Some(self.clone()),
                    };
                    debug!(tool = %name, tool_use_id = %id, "running tool");
                    let out = (tool.runner)(tool_ctx, input.clone()).await;
                    self.tool_use_cancel.lock().unwrap().remove(id);
                    out
                }
            };

            let (content, is_error) = match outcome {
                Ok(blocks) => (blocks, false),
                Err(e) => (vec![ContentBlock::text(e.to_string())], true),
            };
            self.emit(ToolEvent::Result {
                conversation_id: self.id.clone(),
                parent_conversation_id: self.parent_id.clone(),
                tool_use_id: id.clone(),
                name: name.clone(),
                content: content
                    .iter()
                    .map(ContentBlock::text_content)
                    .collect::<Vec<_>>()
                    .join(""),
                is_error,
            });
            results.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content,
                is_error,
            });
        }
        Ok(results)
    }

    /// Cancel the outstanding tool use with the given id.
    ///
    /// Returns an error if no such tool use is in flight. Safe to call
    /// concurrently with tool dispatch.
    pub fn cancel_tool_use(&self, id: &str, cause: &str) -> Result<()> {
        let token = self.tool_use_cancel.lock().unwrap().remove(id);
        match token {
            Some(token) => {
                debug!(tool_use_id = %id, cause, "cancelling tool use");
                token.cancel();
                Ok(())
            }
            None => Err(MendError::Tool(format!("no outstanding tool use with id {id}"))),
        }
    }

    /// Cancel every outstanding tool use; the map is empty afterwards.
    pub fn cancel_all_tool_uses(&self, cause: &str) {
        let tokens: Vec<_> = {
            let mut map = self.tool_use_cancel.lock().unwrap();
            map.drain().collect()
        };
        for (id, token) in tokens {
            debug!(tool_use_id = %id, cause, "cancelling tool use");
            token.cancel();
        }
    }

    /// Total byte size of the conversation history.
    pub fn history_size(&self) -> usize {
        self.history
            .lock()
            .unwrap()
            .iter()
            .map(ChatMessage::approx_size)
            .sum()
    }

    /// Replace large tool-result text blocks with a short placeholder and
    /// return the number of bytes removed. An immediate second call
    /// reports zero.
    pub fn compact(&self) -> usize {
        let mut compacted = 0usize;
        let mut history = self.history.lock().unwrap();
        for msg in history.iter_mut() {
            for block in msg.content.iter_mut() {
                if let ContentBlock::ToolResult { content, .. } = block {
                    for inner in content.iter_mut() {
                        if let ContentBlock::Text { text } = inner {
                            if text.len() > COMPACT_BLOCK_CUTOFF && text != COMPACTED_PLACEHOLDER {
                                compacted += text.len() - COMPACTED_PLACEHOLDER.len();
                                *text = COMPACTED_PLACEHOLDER.to_string();
                            }
                        }
                    }
                }
            }
        }
        compacted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Role;
    use crate::service::MockService;
    use crate::tool::Tool;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_tool() -> Tool {
        Tool::new(
            "echo",
            "echo input",
            json!({"type": "object"}),
            |_ctx, input| async move { Ok(vec![ContentBlock::text(input["text"].as_str().unwrap_or("").to_string())]) },
        )
    }

    #[tokio::test]
    async fn send_accrues_usage() {
        let svc = Arc::new(MockService::new(vec![
            MockService::text_response("hi"),
            MockService::text_response("again"),
        ]));
        let convo = Conversation::new(svc);
        convo.send_user_text("hello").await.unwrap();
        convo.send_user_text("more").await.unwrap();
        let usage = convo.usage();
        assert_eq!(usage.responses, 2);
        assert_eq!(usage.input_tokens, 20);
        assert_eq!(usage.output_tokens, 10);
        assert!(usage.total_cost_usd > 0.0);
    }

    #[tokio::test]
    async fn tool_results_preserve_order() {
        let svc = Arc::new(MockService::new(vec![]));
        let convo = Conversation::new(svc);
        convo.set_tools(vec![echo_tool()]);
        let resp = Response {
            role: Role::Assistant,
            content: vec![
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "echo".into(),
                    input: json!({"text": "first"}),
                },
                ContentBlock::ToolUse {
                    id: "t2".into(),
                    name: "echo".into(),
                    input: json!({"text": "second"}),
                },
            ],
            stop_reason: crate::content::StopReason::ToolUse,
            usage: Default::default(),
            cost_usd: 0.0,
        };
        let ctx = ToolContext::new("/tmp");
        let results = convo.tool_result_contents(&ctx, &resp).await.unwrap();
        assert_eq!(results.len(), 2);
        match &results[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "t1");
                assert_eq!(content[0].text_content(), "first");
                assert!(!is_error);
            }
            other => panic!("unexpected block: {other:?}"),
        }
        match &results[1] {
            ContentBlock::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, "t2"),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let svc = Arc::new(MockService::new(vec![]));
        let convo = Conversation::new(svc);
        let resp = Response {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "missing".into(),
                input: json!({}),
            }],
            stop_reason: crate::content::StopReason::ToolUse,
            usage: Default::default(),
            cost_usd: 0.0,
        };
        let ctx = ToolContext::new("/tmp");
        let results = convo.tool_result_contents(&ctx, &resp).await.unwrap();
        match &results[0] {
            ContentBlock::ToolResult { is_error, content, .. } => {
                assert!(is_error);
                assert!(content[0].text_content().contains("unknown tool"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_tool_use_semantics() {
        let svc = Arc::new(MockService::new(vec![]));
        let convo = Conversation::new(svc);

        // Nonexistent id errors.
        assert!(convo.cancel_tool_use("nope", "test").is_err());

        // An inserted handle is invoked and removed.
        let token = tokio_util::sync::CancellationToken::new();
        convo
            .tool_use_cancel
            .lock()
            .unwrap()
            .insert("t1".to_string(), token.clone());
        convo.cancel_tool_use("t1", "test").unwrap();
        assert!(token.is_cancelled());
        assert!(convo.outstanding_tool_calls().is_empty());

        // A second cancel for the same id errors.
        assert!(convo.cancel_tool_use("t1", "test").is_err());
    }

    #[tokio::test]
    async fn cancel_all_empties_map() {
        let svc = Arc::new(MockService::new(vec![]));
        let convo = Conversation::new(svc);
        for id in ["a", "b", "c"] {
            convo
                .tool_use_cancel
                .lock()
                .unwrap()
                .insert(id.to_string(), tokio_util::sync::CancellationToken::new());
        }
        convo.cancel_all_tool_uses("turn cancelled");
        assert!(convo.outstanding_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn sub_conversation_shares_usage() {
        let svc = Arc::new(MockService::new(vec![MockService::text_response("sub")]));
        let convo = Conversation::new(svc);
        let sub = convo.sub_conversation(true);
        assert_eq!(sub.parent_id(), Some(convo.id()));
        sub.send_user_text("hello").await.unwrap();
        // Usage accrued in the sub-conversation is visible on the root.
        assert_eq!(convo.usage().responses, 1);
    }

    #[tokio::test]
    async fn hidden_sub_conversation_emits_no_events() {
        let svc = Arc::new(MockService::new(vec![]));
        let convo = Conversation::new(svc);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        convo.set_tool_event_sink(Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        convo.set_tools(vec![echo_tool()]);

        let sub = convo.sub_conversation(true);
        sub.set_tools(vec![echo_tool()]);
        let resp = Response {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "echo".into(),
                input: json!({"text": "x"}),
            }],
            stop_reason: crate::content::StopReason::ToolUse,
            usage: Default::default(),
            cost_usd: 0.0,
        };
        let ctx = ToolContext::new("/tmp");
        sub.tool_result_contents(&ctx, &resp).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // The visible root emits both a use and a result event.
        convo.tool_result_contents(&ctx, &resp).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn compaction_reports_zero_on_second_call() {
        let svc = Arc::new(MockService::new(vec![]));
        let convo = Conversation::new(svc);
        convo.history.lock().unwrap().push(ChatMessage {
            role: Role::User,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: vec![ContentBlock::text("x".repeat(10_000))],
                is_error: false,
            }],
        });
        let first = convo.compact();
        assert!(first > 0);
        assert_eq!(convo.compact(), 0);
    }
}
