//! Provider-agnostic LLM service contract.

use std::sync::Mutex;

use async_trait::async_trait;
use mend_core::{MendError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::{ChatMessage, ContentBlock, Role, StopReason, Usage};

/// Tool surface sent to the provider: name, description, JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
}

/// One request to the model.
#[derive(Debug, Clone)]
pub struct Request {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
    pub tool_choice: Option<ToolChoice>,
}

/// One model response.
#[derive(Debug, Clone)]
pub struct Response {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// Dollar cost of this response, computed by the adapter.
    pub cost_usd: f64,
}

impl Response {
    pub fn tool_uses(&self) -> impl Iterator<Item = &ContentBlock> {
        self.content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// A model provider. Adapters own serialization and transient-error
/// retries; callers only ever see a final result.
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn complete(&self, req: &Request) -> Result<Response>;

    /// Context window of the configured model, in tokens.
    fn token_context_window(&self) -> usize;
}

/// Scripted LLM service for testing (allows driving conversations
/// without network access).
pub struct MockService {
    responses: Mutex<Vec<Response>>,
    requests: Mutex<Vec<Request>>,
}

impl MockService {
    pub fn new(mut responses: Vec<Response>) -> Self {
        // Stored in reverse so pop() yields them in order.
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a plain text end-of-turn response.
    pub fn text_response(text: &str) -> Response {
        Response {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
            cost_usd: 0.001,
        }
    }

    /// Convenience: a response invoking a single tool.
    pub fn tool_use_response(id: &str, name: &str, input: Value) -> Response {
        Response {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            stop_reason: StopReason::ToolUse,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
            cost_usd: 0.001,
        }
    }

    /// Requests observed so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmService for MockService {
    async fn complete(&self, req: &Request) -> Result<Response> {
        self.requests.lock().unwrap().push(req.clone());
        self.responses
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| MendError::Llm("mock service ran out of scripted responses".to_string()))
    }

    fn token_context_window(&self) -> usize {
        200_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_service_yields_in_order() {
        let svc = MockService::new(vec![
            MockService::text_response("first"),
            MockService::text_response("second"),
        ]);
        let req = Request {
            system: String::new(),
            messages: vec![],
            tools: vec![],
            tool_choice: None,
        };
        assert_eq!(svc.complete(&req).await.unwrap().text(), "first");
        assert_eq!(svc.complete(&req).await.unwrap().text(), "second");
        assert!(svc.complete(&req).await.is_err());
        assert_eq!(svc.requests().len(), 3);
    }

    #[test]
    fn tool_use_response_has_tool_use_stop_reason() {
        let resp = MockService::tool_use_response("t1", "shell", json!({"command": "ls"}));
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.tool_uses().count(), 1);
    }
}
