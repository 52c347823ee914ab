//! Keyword search tool: ripgrep plus an LLM relevance pass.

use std::path::{Path, PathBuf};

use mend_core::{MendError, Result};
use mend_llm::{ChatMessage, ContentBlock, Role, Tool, ToolContext};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

const KEYWORD_DESCRIPTION: &str = "\
keyword_search locates files with a search-and-filter approach.
Use when navigating unfamiliar codebases with only conceptual
understanding or vague user questions.

Effective use:
- Provide a detailed query for accurate relevance ranking
- Include extensive but uncommon keywords to ensure comprehensive results
- Order keywords by importance (most important first) - less important
  keywords may be dropped if there are too many results

IMPORTANT: Do NOT use this tool if you have precise information like log
lines, error messages, filenames, symbols, or package names. Use direct
approaches (grep, cat, cargo doc, etc.) instead.";

const RELEVANCE_SYSTEM_PROMPT: &str = "\
The assistant filters raw code search results for relevance.

The user provides a working directory, ripgrep output, and the question
they are trying to answer. Reply with only the file paths and line
snippets that plausibly help answer the question, preserving their
original formatting. Omit everything irrelevant. Do not add commentary.";

/// A term whose solo search result exceeds this is treated as a stopword.
const STOPWORD_RESULT_LIMIT: usize = 64 * 1024;
/// Keywords are peeled until the combined result fits this budget.
const RESULT_BUDGET: usize = 128 * 1024;

#[derive(Debug, Deserialize)]
struct KeywordInput {
    query: String,
    keywords: Vec<String>,
}

pub fn keyword_tool() -> Tool {
    Tool::new(
        "keyword_search",
        KEYWORD_DESCRIPTION,
        json!({
            "type": "object",
            "required": ["query", "keywords"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "A detailed statement of what you're trying to find or learn."
                },
                "keywords": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "List of keywords in descending order of importance."
                }
            }
        }),
        |ctx, input| async move { run(ctx, input).await },
    )
}

async fn run(ctx: ToolContext, input: serde_json::Value) -> Result<Vec<ContentBlock>> {
    let req: KeywordInput = serde_json::from_value(input)
        .map_err(|e| MendError::ToolInput(format!("bad keyword_search input: {e}")))?;

    let wd = repo_root(&ctx.working_dir)
        .await
        .unwrap_or_else(|| ctx.working_dir.clone());
    info!(query = %req.query, keywords = ?req.keywords, wd = %wd.display(), "keyword search");

    // Remove stopwords: terms that match an enormous share of the tree.
    let mut keep = Vec::new();
    for term in &req.keywords {
        let out = ripgrep(&wd, std::slice::from_ref(term)).await?;
        if out.len() > STOPWORD_RESULT_LIMIT {
            info!(term = %term, bytes = out.len(), "keyword search term too common, dropping");
            continue;
        }
        keep.push(term.clone());
    }

    // Peel off the least important keywords until the result fits.
    let mut out;
    loop {
        out = ripgrep(&wd, &keep).await?;
        if out.len() < RESULT_BUDGET || keep.is_empty() {
            break;
        }
        keep.pop();
    }

    let convo = ctx
        .convo
        .as_ref()
        .ok_or_else(|| MendError::Tool("no conversation context available for keyword search".to_string()))?;
    let sub = convo.sub_conversation(true);
    sub.set_system_prompt(RELEVANCE_SYSTEM_PROMPT);

    let resp = sub
        .send_message(ChatMessage {
            role: Role::User,
            content: vec![
                ContentBlock::text(format!("<pwd>\n{}\n</pwd>", wd.display())),
                ContentBlock::text(format!("<ripgrep_results>\n{out}\n</ripgrep_results>")),
                ContentBlock::text(format!("<query>\n{}\n</query>", req.query)),
            ],
        })
        .await?;

    let filtered = resp.text();
    info!(
        bytes = out.len(),
        filtered_bytes = filtered.len(),
        "keyword search results processed"
    );
    Ok(vec![ContentBlock::text(filtered)])
}

async fn repo_root(wd: &Path) -> Option<PathBuf> {
    let out = tokio::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(wd)
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    Some(PathBuf::from(String::from_utf8_lossy(&out.stdout).trim()))
}

/// Run ripgrep with each term as an OR'd pattern.
async fn ripgrep(wd: &Path, terms: &[String]) -> Result<String> {
    let mut args: Vec<String> = vec![
        "-C".into(),
        "10".into(),
        "-i".into(),
        "--line-number".into(),
        "--with-filename".into(),
    ];
    for term in terms {
        args.push("-e".into());
        args.push(term.clone());
    }
    let out = tokio::process::Command::new("rg")
        .args(&args)
        .current_dir(wd)
        .output()
        .await
        .map_err(|e| MendError::Tool(format!("search failed: {e}")))?;

    // ripgrep exits 1 when nothing matched; that is not an error for us.
    if !out.status.success() {
        if out.status.code() == Some(1) {
            return Ok("no matches found".to_string());
        }
        return Err(MendError::Tool(format!(
            "search failed: {}\n{}",
            out.status,
            String::from_utf8_lossy(&out.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}
