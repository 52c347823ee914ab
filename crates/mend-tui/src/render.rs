//! Message rendering for the terminal.

use mend_core::{AgentMessage, MessageKind};
use serde_json::Value;

/// Render a tool-use message with its per-tool template: an emoji plus
/// the key fields of the JSON input.
pub fn render_tool_use(msg: &AgentMessage) -> String {
    let input: Value = msg
        .tool_input
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null);
    let err = if msg.tool_error { "〰️ " } else { "" };
    let name = msg.tool_name.as_deref().unwrap_or("");
    let body = match name {
        "think" => format!("🧠 {}", field(&input, "thoughts")),
        "keyword_search" => format!(
            "🔍 {}: {}",
            field(&input, "query"),
            input
                .get("keywords")
                .and_then(Value::as_array)
                .map(|terms| {
                    terms
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default()
        ),
        "shell" => {
            let bg = input
                .get("background")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            format!("🖥️{}  {}", if bg { "🔄" } else { "" }, field(&input, "command"))
        }
        "patch" => format!("⌨️  {}", field(&input, "path")),
        "codereview" => "🐛  Running automated code review, may be slow".to_string(),
        "done" => String::new(),
        other => format!("🛠️  {other}: {input}"),
    };
    format!("{err}{body}")
}

fn field<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Sender glyph and body for a chat-style message; None for messages the
/// terminal renders through other paths.
pub fn render_message(msg: &AgentMessage) -> Option<String> {
    match msg.kind {
        MessageKind::Agent => Some(format!("🕴️  {}", msg.content)),
        MessageKind::User => Some(format!("🦸 {}", msg.content)),
        MessageKind::ToolUse => {
            let line = render_tool_use(msg);
            if line.is_empty() {
                None
            } else {
                Some(line)
            }
        }
        MessageKind::ToolResult => {
            // Successful results are folded into the next agent message;
            // failures are worth a line of their own.
            if msg.tool_error {
                let text = msg.tool_result.as_deref().unwrap_or("");
                let first_line = text.lines().next().unwrap_or("");
                Some(format!("〰️ {first_line}"))
            } else {
                None
            }
        }
        MessageKind::Error => Some(format!("❌ {}", msg.content)),
        MessageKind::Budget => Some(format!("💰 {}", msg.content)),
        MessageKind::Auto => Some(format!("🧐 {}", msg.content)),
        MessageKind::System => Some(msg.content.clone()),
        MessageKind::Commit => {
            let mut out = String::new();
            for commit in &msg.commits {
                if let Some(branch) = &commit.pushed_branch {
                    out.push_str(&format!(
                        "🔄 new commit: [{}] {}\npushed to: {branch}\n",
                        commit.short_hash, commit.subject
                    ));
                } else {
                    out.push_str(&format!(
                        "🔄 new commit: [{}] {}\n",
                        commit.short_hash, commit.subject
                    ));
                }
            }
            Some(out.trim_end().to_string())
        }
    }
}

/// The prompt: session URL, spend against budget, and a thinking marker.
pub fn render_prompt(http_url: &str, spent: f64, max: f64, thinking: bool) -> String {
    let marker = if thinking { "*" } else { "" };
    format!("{http_url} (${spent:.2}/{max:.2}){marker}> ")
}
