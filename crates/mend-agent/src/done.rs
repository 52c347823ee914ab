//! The done tool: a completion checklist gated on git and review state.

use std::sync::Arc;

use mend_core::MendError;
use mend_llm::{ContentBlock, Tool};
use mend_review::CodeReviewer;
use serde_json::json;

const DONE_DESCRIPTION: &str = "Use this tool when you have achieved the user's goal. \
The parameters form a checklist which you should evaluate.";

const DONE_RESULT: &str = "Please ask the user to review your work. Be concise - users \
are more likely to read shorter comments.";

fn checklist_item(description: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["status"],
        "properties": {
            "status": {
                "type": "string",
                "description": "Current status of the checklist item",
                "enum": ["yes", "no", "not applicable", "other"]
            },
            "comments": {
                "type": "string",
                "description": "Additional comments or context for this checklist item"
            }
        },
        "description": description
    })
}

/// Build the done tool. Completion is refused while the tree is dirty,
/// the repository is mid-merge or mid-rebase, or HEAD is an unreviewed
/// non-initial commit.
pub fn make_done_tool(reviewer: Arc<CodeReviewer>) -> Tool {
    Tool::new(
        "done",
        DONE_DESCRIPTION,
        json!({
            "type": "object",
            "required": ["checklist_items"],
            "properties": {
                "checklist_items": {
                    "type": "object",
                    "description": "Collection of checklist items",
                    "properties": {
                        "checked_guidance": checklist_item(
                            "I checked for and followed any directory-specific guidance files for all modified files."
                        ),
                        "wrote_tests": checklist_item("If code was changed, tests were written or updated."),
                        "passes_tests": checklist_item("If any commits were made, tests pass."),
                        "code_reviewed": checklist_item(
                            "If any commits were made, the codereview tool was run and its output was addressed."
                        ),
                        "git_commit": checklist_item("Create git commits for any code changes you made.")
                    }
                }
            }
        }),
        move |_ctx, _input| {
            let reviewer = reviewer.clone();
            async move {
                // Cannot be done with a messy git.
                reviewer.require_normal_git_state().await?;
                reviewer.require_no_uncommitted_changes().await?;
                // Ensure that the current commit has been reviewed.
                if let Ok(head) = reviewer.current_commit().await {
                    let needs_review =
                        !reviewer.is_initial_commit(&head) && !reviewer.has_reviewed(&head);
                    if needs_review {
                        return Err(MendError::Review(format!(
                            "codereview tool has not been run for commit {head}"
                        )));
                    }
                }
                Ok(vec![ContentBlock::text(DONE_RESULT)])
            }
        },
    )
}
