//! Just-in-time installation of missing command-line tools.
//!
//! Before a shell command runs, the installer extracts the binaries it
//! invokes, checks `$PATH`, and for missing ones opens a hidden
//! sub-conversation that attempts a package-manager install. Attempts are
//! never repeated for the lifetime of the process, and at most one
//! installation sub-conversation runs at a time.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mend_core::{MendError, Result};
use mend_llm::{ContentBlock, ChatMessage, Role, StopReason, Tool, ToolContext};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::shell::ShellTool;

const AUTOINSTALL_SYSTEM_PROMPT: &str = "\
The assistant powers an entirely automated auto-installer tool.

The user will provide a list of commands that were not found on the system.

The assistant's task:

First, decide whether each command is mainstream and safe for automatic \
installation in a development environment. Skip any commands that could \
cause security issues, legal problems, or consume excessive resources.

For each appropriate command:

1. Detect the system's package manager and install the command using \
standard repositories only (no source builds, no curl|bash installs).
2. Make a minimal verification attempt (package manager success is \
sufficient).
3. If installation fails after reasonable attempts, mark as failed and \
move on.

Once all commands have been processed, call the \"done\" tool with the \
status of each command.";

/// Hard stop for a runaway install sub-conversation.
const MAX_INSTALL_STEPS: usize = 16;

/// Shell builtins and keywords that are never installation candidates.
const SKIP_WORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "for", "while", "until", "do", "done", "case", "esac",
    "function", "select", "in", "cd", "echo", "printf", "export", "unset", "set", "source",
    "alias", "read", "exit", "return", "true", "false", "test", "[", "[[", "shift", "local",
    "declare", "eval", "exec", "trap", "wait", "kill", "pwd", "umask", "type",
];

/// Prefix commands whose real command is the next token.
const PREFIX_WORDS: &[&str] = &["sudo", "env", "nohup", "time", "nice", "ionice", "xargs"];

/// Process-scoped JIT installer state.
///
/// Created at agent construction and shared by every shell tool instance;
/// the single lock both serializes installs and guards the skip set.
pub struct Installer {
    state: tokio::sync::Mutex<HashSet<String>>,
}

impl Default for Installer {
    fn default() -> Self {
        Self::new()
    }
}

impl Installer {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Ensure the binaries `command` invokes exist, best effort.
    ///
    /// Install failures are non-fatal: the outer command proceeds and
    /// fails on its own terms if the binary is truly unavailable.
    pub async fn ensure_tools(&self, ctx: &ToolContext, command: &str) -> Result<()> {
        let commands = extract_commands(command);
        if commands.is_empty() {
            return Ok(());
        }

        // Process-wide lock: serializes concurrent installs and protects
        // the do-not-retry set.
        let mut skip = self.state.lock().await;

        let mut missing = Vec::new();
        for cmd in commands {
            if skip.contains(&cmd) {
                continue;
            }
            if lookup_path(&cmd) {
                skip.insert(cmd); // spare future PATH walks
                continue;
            }
            missing.push(cmd);
        }
        if missing.is_empty() {
            return Ok(());
        }

        let result = self.install_tools(ctx, &missing).await;
        for cmd in missing {
            // Either it is installed now or it is not; we are done with it.
            skip.insert(cmd);
        }
        result
    }

    async fn install_tools(&self, ctx: &ToolContext, missing: &[String]) -> Result<()> {
        info!(tools = ?missing, "starting tool install sub-conversation");

        let convo = ctx
            .convo
            .as_ref()
            .ok_or_else(|| MendError::Tool("no conversation context available for tool installation".to_string()))?;
        let sub = convo.sub_conversation(true);
        sub.set_system_prompt(AUTOINSTALL_SYSTEM_PROMPT);

        let done = Arc::new(AtomicBool::new(false));
        let done_flag = done.clone();
        let done_tool = Tool::new(
            "done",
            "Call this tool once when finished processing all commands, providing the installation status for each.",
            json!({
                "type": "object",
                "required": ["results"],
                "properties": {
                    "results": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["command_name", "installed"],
                            "properties": {
                                "command_name": {"type": "string", "description": "The name of the command"},
                                "installed": {"type": "boolean", "description": "Whether the command was installed"}
                            }
                        }
                    }
                }
            }),
            move |_ctx, input| {
                let done_flag = done_flag.clone();
                async move {
                    #[derive(Deserialize)]
                    struct InstallResult {
                        command_name: String,
                        installed: bool,
                    }
                    #[derive(Deserialize)]
                    struct DoneInput {
                        results: Vec<InstallResult>,
                    }
                    match serde_json::from_value::<DoneInput>(input) {
                        Ok(parsed) => {
                            for r in &parsed.results {
                                info!(command = %r.command_name, installed = r.installed, "tool installation result");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to parse install results"),
                    }
                    done_flag.store(true, Ordering::SeqCst);
                    Ok(vec![ContentBlock::text("")])
                }
            },
        );

        // The inner shell tool runs with JIT disabled to prevent recursion.
        let sub_shell = ShellTool::default();
        sub.set_tools(vec![sub_shell.tool(), done_tool]);

        let mut commands = String::from("<commands>\n");
        for cmd in missing {
            commands.push_str("<command>");
            commands.push_str(cmd);
            commands.push_str("</command>\n");
        }
        commands.push_str("</commands>\n");

        let mut resp = sub.send_user_text(commands).await?;
        let mut steps = 0usize;
        while !done.load(Ordering::SeqCst) {
            steps += 1;
            if steps > MAX_INSTALL_STEPS {
                return Err(MendError::Tool("tool installation did not converge".to_string()));
            }
            if resp.stop_reason != StopReason::ToolUse {
                return Err(MendError::Tool("subagent finished without calling tool".to_string()));
            }
            let results = sub.tool_result_contents(ctx, &resp).await?;
            resp = sub
                .send_message(ChatMessage {
                    role: Role::User,
                    content: results,
                })
                .await?;
        }
        Ok(())
    }
}

/// Extract the top-level binaries a shell command invokes.
pub fn extract_commands(command: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();

    // Split on shell operators so each segment starts at a command position.
    let separated = command
        .replace("&&", "\n")
        .replace("||", "\n")
        .replace(';', "\n")
        .replace('|', "\n");

    for segment in separated.lines() {
        let Some(tokens) = shlex::split(segment.trim()) else {
            continue;
        };
        let mut tokens = tokens.into_iter();
        let mut candidate = None;
        for token in tokens.by_ref() {
            // Leading env assignments: FOO=bar cmd ...
            if token.contains('=') && !token.starts_with('=') {
                continue;
            }
            if token.starts_with('-') {
                continue;
            }
            if PREFIX_WORDS.contains(&token.as_str()) {
                continue;
            }
            candidate = Some(token);
            break;
        }
        let Some(cmd) = candidate else { continue };
        // Paths are invoked directly, not installed by name.
        if cmd.contains('/') {
            continue;
        }
        if SKIP_WORDS.contains(&cmd.as_str()) {
            continue;
        }
        if seen.insert(cmd.clone()) {
            found.push(cmd);
        }
    }
    found
}

/// True when `cmd` resolves to an executable on `$PATH`.
pub fn lookup_path(cmd: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    for dir in std::env::split_paths(&path) {
        let full = dir.join(cmd);
        if is_executable(&full) {
            return true;
        }
    }
    false
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_llm::{Conversation, MockService};

    #[test]
    fn extracts_simple_command() {
        assert_eq!(extract_commands("jq .foo bar.json"), vec!["jq"]);
    }

    #[test]
    fn extracts_across_operators() {
        let cmds = extract_commands("make build && rg TODO | head -5; git status");
        assert_eq!(cmds, vec!["make", "rg", "head", "git"]);
    }

    #[test]
    fn skips_assignments_flags_and_builtins() {
        let cmds = extract_commands("FOO=1 env BAR=2 htop");
        assert_eq!(cmds, vec!["htop"]);
        assert!(extract_commands("cd /tmp && echo hi").is_empty());
        assert!(extract_commands("./script.sh").is_empty());
    }

    #[test]
    fn sudo_prefix_yields_real_command() {
        assert_eq!(extract_commands("sudo apt-get update"), vec!["apt-get"]);
    }

    #[test]
    fn dedupes_commands() {
        assert_eq!(extract_commands("git add . && git commit"), vec!["git"]);
    }

    #[test]
    fn lookup_finds_shell() {
        assert!(lookup_path("sh"));
        assert!(!lookup_path("definitely-not-a-real-binary-xyz"));
    }

    #[tokio::test]
    async fn present_tools_skip_installation() {
        let installer = Installer::new();
        // "sh" exists, so no sub-conversation is needed and the missing
        // conversation context is never an error.
        let ctx = ToolContext::new("/tmp");
        installer.ensure_tools(&ctx, "sh -c 'echo hi'").await.unwrap();
    }

    #[tokio::test]
    async fn missing_tool_without_convo_errors_once_then_skips() {
        let installer = Installer::new();
        let ctx = ToolContext::new("/tmp");
        // First attempt fails: no conversation to drive the install.
        let err = installer
            .ensure_tools(&ctx, "definitely-not-a-real-binary-xyz --version")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no conversation context"), "got: {err}");
        // Second attempt is a no-op: the command entered the skip set.
        installer
            .ensure_tools(&ctx, "definitely-not-a-real-binary-xyz --version")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn install_subconversation_runs_until_done() {
        let svc = Arc::new(MockService::new(vec![
            // The sub-conversation immediately reports both results.
            MockService::tool_use_response(
                "t1",
                "done",
                json!({"results": [
                    {"command_name": "definitely-not-a-real-binary-xyz", "installed": false}
                ]}),
            ),
            // After the done tool result, the model closes with text.
            MockService::text_response("done"),
        ]));
        let convo = Conversation::new(svc);
        let mut ctx = ToolContext::new("/tmp");
        ctx.convo = Some(convo);

        let installer = Installer::new();
        installer
            .ensure_tools(&ctx, "definitely-not-a-real-binary-xyz --version")
            .await
            .unwrap();
    }
}
