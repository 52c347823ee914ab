//! Quick syntactic safety check for shell commands.
//!
//! This is a tripwire for obvious catastrophes, not a security barrier.
//! A caller-supplied permission callback runs after it and can enforce
//! real policy.

use std::sync::Arc;

use mend_core::{MendError, Result};

/// Called before running any command; returning an error refuses it.
pub type PermissionCallback = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Refuse commands matching a known danger pattern.
pub fn check(command: &str) -> Result<()> {
    if command.contains(":(){") || command.contains(":() {") {
        return refuse("fork bomb");
    }

    for segment in command
        .replace("&&", "\n")
        .replace("||", "\n")
        .replace(';', "\n")
        .replace('|', "\n")
        .lines()
    {
        let Some(tokens) = shlex::split(segment.trim()) else {
            continue;
        };
        if tokens.is_empty() {
            continue;
        }
        let cmd = tokens[0].rsplit('/').next().unwrap_or(&tokens[0]);

        if cmd.starts_with("mkfs") {
            return refuse("filesystem format");
        }

        if cmd == "rm" && flags_contain(&tokens, 'r') && flags_contain(&tokens, 'f') {
            if tokens.iter().any(|t| t == "/" || t == "/*") {
                return refuse("recursive deletion of the filesystem root");
            }
            if tokens.iter().any(|t| t == "--no-preserve-root") {
                return refuse("rm --no-preserve-root");
            }
        }

        if (cmd == "chmod" || cmd == "chown")
            && flags_contain(&tokens, 'R')
            && tokens.iter().any(|t| t == "/")
        {
            return refuse("recursive permission change on the filesystem root");
        }

        // dd or redirection writing straight to a disk device.
        for (i, token) in tokens.iter().enumerate() {
            let target = token.strip_prefix("of=").unwrap_or_else(|| {
                if token == ">" || token == ">>" {
                    tokens.get(i + 1).map(String::as_str).unwrap_or("")
                } else {
                    ""
                }
            });
            if target.starts_with("/dev/sd") || target.starts_with("/dev/nvme") {
                return refuse("raw write to a disk device");
            }
        }
    }
    Ok(())
}

fn refuse(reason: &str) -> Result<()> {
    Err(MendError::CommandRefused(format!(
        "command matches disallowed pattern: {reason}"
    )))
}

/// True when any single-dash flag token contains `flag`.
fn flags_contain(tokens: &[String], flag: char) -> bool {
    tokens
        .iter()
        .any(|t| t.starts_with('-') && !t.starts_with("--") && t.contains(flag))
}
