//! Anthropic API adapter.
//!
//! Owns the wire format and transient-error handling: rate limits and
//! server errors are retried with bounded exponential backoff before an
//! error ever reaches the conversation engine.

use std::time::Duration;

use async_trait::async_trait;
use mend_core::{MendError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::content::{ChatMessage, ContentBlock, Role, StopReason, Usage};
use crate::service::{LlmService, Request, Response, ToolChoice, ToolDescriptor};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

// Retry configuration for rate limits and server errors.
const MAX_RETRIES: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Anthropic messages API client.
pub struct AnthropicService {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicService {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn build_request(&self, req: &Request) -> WireRequest {
        WireRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: if req.system.is_empty() {
                None
            } else {
                Some(req.system.clone())
            },
            messages: req.messages.clone(),
            tools: req.tools.clone(),
            tool_choice: req.tool_choice,
        }
    }
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Deserialize)]
struct WireResponse {
    role: Role,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<StopReason>,
    #[serde(default)]
    usage: Usage,
}

#[async_trait]
impl LlmService for AnthropicService {
    async fn complete(&self, req: &Request) -> Result<Response> {
        let wire = self.build_request(req);

        let mut retries = 0u32;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            debug!(attempt = retries + 1, model = %self.model, "sending request to Anthropic API");

            let response = self
                .client
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&wire)
                .send()
                .await
                .map_err(|e| MendError::Llm(format!("failed to send request: {e}")))?;

            let status = response.status();

            // Rate limit: honor retry-after when present, else back off.
            if status.as_u16() == 429 {
                retries += 1;
                if retries > MAX_RETRIES {
                    let body = response.text().await.unwrap_or_default();
                    return Err(MendError::LlmRateLimit(format!(
                        "rate limit exceeded after {MAX_RETRIES} retries: {body}"
                    )));
                }
                let wait = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(backoff);
                warn!(
                    wait_secs = wait.as_secs(),
                    retry = retries,
                    max = MAX_RETRIES,
                    "rate limited (429)"
                );
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                if status.is_server_error() && retries < MAX_RETRIES {
                    retries += 1;
                    warn!(
                        %status,
                        wait_secs = backoff.as_secs(),
                        retry = retries,
                        max = MAX_RETRIES,
                        "server error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
                return Err(MendError::Llm(format!("Anthropic API error {status}: {body}")));
            }

            let wire_resp: WireResponse = response
                .json()
                .await
                .map_err(|e| MendError::Llm(format!("failed to parse response: {e}")))?;

            let usage = wire_resp.usage;
            let cost_usd = response_cost(&self.model, &usage);
            debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                cost_usd,
                "response received"
            );

            return Ok(Response {
                role: wire_resp.role,
                content: wire_resp.content,
                stop_reason: wire_resp.stop_reason.unwrap_or_default(),
                usage,
                cost_usd,
            });
        }
    }

    fn token_context_window(&self) -> usize {
        200_000
    }
}

/// Dollar prices per million tokens: (input, cache read, cache write, output).
fn model_rates(model: &str) -> (f64, f64, f64, f64) {
    if model.contains("opus") {
        (15.0, 1.5, 18.75, 75.0)
    } else if model.contains("haiku") {
        (0.8, 0.08, 1.0, 4.0)
    } else {
        // sonnet family default
        (3.0, 0.3, 3.75, 15.0)
    }
}

/// Cost of a single response in dollars.
pub fn response_cost(model: &str, usage: &Usage) -> f64 {
    let (input, cache_read, cache_write, output) = model_rates(model);
    const M: f64 = 1_000_000.0;
    usage.input_tokens as f64 / M * input
        + usage.cache_read_input_tokens as f64 / M * cache_read
        + usage.cache_creation_input_tokens as f64 / M * cache_write
        + usage.output_tokens as f64 / M * output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_uses_all_token_classes() {
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            cache_read_input_tokens: 1_000_000,
            cache_creation_input_tokens: 0,
        };
        let cost = response_cost("claude-sonnet-4-20250514", &usage);
        assert!((cost - (3.0 + 0.3 + 15.0)).abs() < 1e-9, "got {cost}");
    }

    #[test]
    fn opus_costs_more_than_haiku() {
        let usage = Usage {
            input_tokens: 1000,
            output_tokens: 1000,
            ..Default::default()
        };
        assert!(response_cost("claude-opus-4", &usage) > response_cost("claude-haiku-3", &usage));
    }

    #[test]
    fn wire_request_omits_empty_tools() {
        let svc = AnthropicService::new("key", "claude-sonnet-4-20250514");
        let req = Request {
            system: String::new(),
            messages: vec![ChatMessage::user_text("hi")],
            tools: vec![],
            tool_choice: None,
        };
        let wire = svc.build_request(&req);
        let json = serde_json::to_string(&wire).unwrap();
        assert!(!json.contains("tools"), "got: {json}");
        assert!(!json.contains("system"), "got: {json}");
    }
}
