//! File patch tool: targeted text replacement without shelling out.

use std::path::{Component, Path, PathBuf};

use mend_core::{MendError, Result};
use mend_llm::{ContentBlock, Tool, ToolContext};
use serde::Deserialize;
use serde_json::json;

const PATCH_DESCRIPTION: &str = "\
Edits a file with one or more operations. replace swaps old_text (which
must appear exactly once) for new_text; append adds new_text to the end;
overwrite replaces the whole file, creating it if needed.";

#[derive(Debug, Deserialize)]
struct PatchInput {
    path: String,
    operations: Vec<PatchOp>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PatchOp {
    Replace { old_text: String, new_text: String },
    Append { new_text: String },
    Overwrite { new_text: String },
}

pub fn patch_tool() -> Tool {
    Tool::new(
        "patch",
        PATCH_DESCRIPTION,
        json!({
            "type": "object",
            "required": ["path", "operations"],
            "properties": {
                "path": {"type": "string", "description": "File to edit, relative to the working directory"},
                "operations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["kind"],
                        "properties": {
                            "kind": {"type": "string", "enum": ["replace", "append", "overwrite"]},
                            "old_text": {"type": "string"},
                            "new_text": {"type": "string"}
                        }
                    }
                }
            }
        }),
        |ctx, input| async move { run(ctx, input) },
    )
}

fn run(ctx: ToolContext, input: serde_json::Value) -> Result<Vec<ContentBlock>> {
    let req: PatchInput = serde_json::from_value(input)
        .map_err(|e| MendError::ToolInput(format!("bad patch input: {e}")))?;
    let path = resolve_path(&ctx.working_dir, &req.path)?;

    let mut contents = if path.exists() {
        std::fs::read_to_string(&path)?
    } else {
        String::new()
    };
    let existed = path.exists();

    let mut summary = Vec::new();
    for (i, op) in req.operations.iter().enumerate() {
        match op {
            PatchOp::Replace { old_text, new_text } => {
                if !existed {
                    return Err(MendError::Tool(format!(
                        "cannot replace in nonexistent file {}",
                        req.path
                    )));
                }
                let count = contents.matches(old_text.as_str()).count();
                if count == 0 {
                    return Err(MendError::Tool(format!(
                        "operation {i}: old_text not found in {}",
                        req.path
                    )));
                }
                if count > 1 {
                    return Err(MendError::Tool(format!(
                        "operation {i}: old_text appears {count} times in {}; it must be unique",
                        req.path
                    )));
                }
                contents = contents.replacen(old_text.as_str(), new_text, 1);
                summary.push(format!("replaced {} bytes", old_text.len()));
            }
            PatchOp::Append { new_text } => {
                contents.push_str(new_text);
                summary.push(format!("appended {} bytes", new_text.len()));
            }
            PatchOp::Overwrite { new_text } => {
                contents = new_text.clone();
                summary.push(format!("wrote {} bytes", new_text.len()));
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &contents)?;

    Ok(vec![ContentBlock::text(format!(
        "patched {}: {}",
        req.path,
        summary.join(", ")
    ))])
}

/// Single-replacement variant of the patch tool, closer to the editor
/// tools some models are trained on. Selected by environment flag.
pub fn str_replace_tool() -> Tool {
    Tool::new(
        "str_replace",
        "Replace old_str (which must appear exactly once) with new_str in the given file. \
         An empty old_str creates or overwrites the file with new_str.",
        json!({
            "type": "object",
            "required": ["path", "old_str", "new_str"],
            "properties": {
                "path": {"type": "string", "description": "File to edit, relative to the working directory"},
                "old_str": {"type": "string"},
                "new_str": {"type": "string"}
            }
        }),
        |ctx, input| async move {
            #[derive(Deserialize)]
            struct StrReplaceInput {
                path: String,
                old_str: String,
                new_str: String,
            }
            let req: StrReplaceInput = serde_json::from_value(input)
                .map_err(|e| MendError::ToolInput(format!("bad str_replace input: {e}")))?;
            let op = if req.old_str.is_empty() {
                json!({"kind": "overwrite", "new_text": req.new_str})
            } else {
                json!({"kind": "replace", "old_text": req.old_str, "new_text": req.new_str})
            };
            run(ctx, json!({"path": req.path, "operations": [op]}))
        },
    )
}

/// Resolve a tool-supplied path under the working directory, refusing
/// traversal outside it.
fn resolve_path(working_dir: &Path, raw: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        working_dir.join(candidate)
    };
    let mut normal = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normal.pop() {
                    return Err(MendError::ToolInput(format!("path escapes working directory: {raw}")));
                }
            }
            Component::CurDir => {}
            other => normal.push(other),
        }
    }
    if !normal.starts_with(working_dir) {
        return Err(MendError::ToolInput(format!("path escapes working directory: {raw}")));
    }
    Ok(normal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> ToolContext {
        ToolContext::new(dir.path())
    }

    async fn patch(ctx: ToolContext, input: serde_json::Value) -> Result<String> {
        let out = (patch_tool().runner)(ctx, input).await?;
        Ok(out[0].text_content())
    }

    #[tokio::test]
    async fn overwrite_creates_file() {
        let dir = TempDir::new().unwrap();
        patch(
            ctx(&dir),
            json!({"path": "a.txt", "operations": [{"kind": "overwrite", "new_text": "hello"}]}),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn replace_requires_unique_match() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x y x").unwrap();
        let err = patch(
            ctx(&dir),
            json!({"path": "a.txt", "operations": [{"kind": "replace", "old_text": "x", "new_text": "z"}]}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("must be unique"), "got: {err}");

        patch(
            ctx(&dir),
            json!({"path": "a.txt", "operations": [{"kind": "replace", "old_text": "y", "new_text": "z"}]}),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "x z x");
    }

    #[tokio::test]
    async fn append_then_replace_in_one_call() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "start\n").unwrap();
        patch(
            ctx(&dir),
            json!({"path": "a.txt", "operations": [
                {"kind": "append", "new_text": "end\n"},
                {"kind": "replace", "old_text": "start", "new_text": "begin"}
            ]}),
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "begin\nend\n"
        );
    }

    #[tokio::test]
    async fn refuses_path_escape() {
        let dir = TempDir::new().unwrap();
        let err = patch(
            ctx(&dir),
            json!({"path": "../../etc/passwd", "operations": [{"kind": "overwrite", "new_text": "x"}]}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("escapes working directory"), "got: {err}");
    }
}
