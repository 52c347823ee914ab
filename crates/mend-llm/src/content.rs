//! Message content blocks shared by the conversation engine and adapters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One content block inside a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Concatenated text of this block, empty for non-text blocks.
    pub fn text_content(&self) -> String {
        match self {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::ToolResult { content, .. } => content
                .iter()
                .map(ContentBlock::text_content)
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Approximate byte size of the message, used by history compaction.
    pub fn approx_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(other)]
    Other,
}

/// Token counts reported by the provider for a single response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_block_round_trip() {
        let block = ContentBlock::ToolUse {
            id: "toolu_1".to_string(),
            name: "shell".to_string(),
            input: json!({"command": "echo hi"}),
        };
        let encoded = serde_json::to_string(&block).unwrap();
        assert!(encoded.contains(r#""type":"tool_use""#), "got: {encoded}");
        let decoded: ContentBlock = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn tool_result_text_content_flattens() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "toolu_1".to_string(),
            content: vec![ContentBlock::text("hello "), ContentBlock::text("world")],
            is_error: false,
        };
        assert_eq!(block.text_content(), "hello world");
    }

    #[test]
    fn unknown_stop_reason_parses_as_other() {
        let reason: StopReason = serde_json::from_str(r#""pause_turn""#).unwrap();
        assert_eq!(reason, StopReason::Other);
    }
}
