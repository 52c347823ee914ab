//! Scratchpad tool: lets the model record reasoning without side effects.

use mend_llm::{ContentBlock, Tool};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct ThinkInput {
    #[serde(default)]
    thoughts: String,
}

pub fn think_tool() -> Tool {
    Tool::new(
        "think",
        "Think out loud, take notes, form plans. Has no external effects.",
        json!({
            "type": "object",
            "required": ["thoughts"],
            "properties": {
                "thoughts": {"type": "string", "description": "The thoughts, notes, or plans to record"}
            }
        }),
        |_ctx, input| async move {
            // Parsing validates the input; the content itself is already
            // visible to the model in its own tool call.
            let _: ThinkInput = serde_json::from_value(input)
                .map_err(|e| mend_core::MendError::ToolInput(format!("bad think input: {e}")))?;
            Ok(vec![ContentBlock::text("recorded")])
        },
    )
}
