//! Shell command execution tool.
//!
//! Commands run through `bash -c` in their own process group, with
//! combined stdout/stderr capture, tiered timeouts, optional PTY, and a
//! detached background mode that redirects output to files.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use mend_core::config::{Timeouts, AGENT_MARKER_ENV};
use mend_core::{MendError, Result};
use mend_llm::{ContentBlock, Tool, ToolContext};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::guard::{self, PermissionCallback};
use crate::install::Installer;
use crate::pty;

const SHELL_TOOL_NAME: &str = "shell";

const SHELL_DESCRIPTION: &str = "\
Executes shell commands via bash -c, returning combined stdout/stderr.

With background=true, returns immediately while the process continues
running with output redirected to files. Kill the process group when done.
Use background for servers/demos that need to stay running.

MUST set slow_ok=true for potentially slow commands: builds, downloads,
installs, tests, or any other substantive operation.

Set pty=true to run commands in a pseudo-terminal environment, which is
required for interactive commands or programs that need terminal-like
behavior.";

/// Maximum bytes of captured output before the result is replaced with a
/// size diagnostic.
pub const MAX_SHELL_OUTPUT: usize = 131072;

#[derive(Debug, Clone, Deserialize)]
struct ShellInput {
    command: String,
    #[serde(default)]
    slow_ok: bool,
    #[serde(default)]
    background: bool,
    #[serde(default)]
    pty: bool,
}

impl ShellInput {
    fn timeout(&self, t: &Timeouts) -> Duration {
        if self.background {
            t.background
        } else if self.slow_ok {
            t.slow
        } else {
            t.fast
        }
    }
}

/// Result of a background launch, returned to the model as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundResult {
    pub pid: i32,
    pub stdout_file: String,
    pub stderr_file: String,
}

/// The shell tool. One instance per agent; cloned into the runner.
#[derive(Clone, Default)]
pub struct ShellTool {
    /// Called before running any command, if set.
    pub check_permission: Option<PermissionCallback>,
    /// Just-in-time installer for missing binaries; None disables JIT.
    pub installer: Option<Arc<Installer>>,
    pub timeouts: Timeouts,
}

impl ShellTool {
    pub fn tool(&self) -> Tool {
        let this = self.clone();
        Tool::new(
            SHELL_TOOL_NAME,
            SHELL_DESCRIPTION,
            json!({
                "type": "object",
                "required": ["command"],
                "properties": {
                    "command": {"type": "string", "description": "Shell to execute"},
                    "slow_ok": {"type": "boolean", "description": "Use extended timeout"},
                    "background": {"type": "boolean", "description": "Execute in background"},
                    "pty": {"type": "boolean", "description": "Use pseudo-terminal (PTY) for execution"}
                }
            }),
            move |ctx, input| {
                let this = this.clone();
                async move { this.run(ctx, input).await }
            },
        )
    }

    async fn run(&self, ctx: ToolContext, input: serde_json::Value) -> Result<Vec<ContentBlock>> {
        let req: ShellInput = serde_json::from_value(input)
            .map_err(|e| MendError::ToolInput(format!("bad shell input: {e}")))?;

        // Quick syntactic check (not a security barrier), then the
        // caller-supplied permission callback; both must pass.
        guard::check(&req.command)?;
        if let Some(check) = &self.check_permission {
            check(&req.command)?;
        }

        // Best-effort just-in-time install of missing binaries.
        if let Some(installer) = &self.installer {
            if let Err(e) = installer.ensure_tools(&ctx, &req.command).await {
                debug!(error = %e, "failed to auto-install missing tools");
            }
        }

        let timeout = req.timeout(&self.timeouts);
        if req.background {
            let result = execute_background(&ctx, &req, timeout).await?;
            let encoded = serde_json::to_string(&result)?;
            return Ok(vec![ContentBlock::text(encoded)]);
        }
        let out = execute_foreground(&ctx, &req, timeout).await?;
        Ok(vec![ContentBlock::text(out)])
    }
}

fn base_command(command: &str, working_dir: &Path) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .env(AGENT_MARKER_ENV, "1");
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// SIGKILL the whole process group; fall back to the single pid.
pub fn kill_group(pid: i32) {
    if pid <= 0 {
        return;
    }
    #[cfg(unix)]
    unsafe {
        if libc::kill(-pid, libc::SIGKILL) != 0 {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

async fn execute_foreground(ctx: &ToolContext, req: &ShellInput, timeout: Duration) -> Result<String> {
    let mut cmd = base_command(&req.command, &ctx.working_dir);

    let use_pty = req.pty && pty::is_supported();
    if req.pty && !use_pty {
        warn!("PTY requested but not supported on this platform, falling back to pipes");
    }

    if use_pty {
        execute_foreground_pty(ctx, req, cmd, timeout).await
    } else {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        execute_foreground_pipes(ctx, req, cmd, timeout).await
    }
}

async fn execute_foreground_pipes(
    ctx: &ToolContext,
    _req: &ShellInput,
    mut cmd: Command,
    timeout: Duration,
) -> Result<String> {
    let mut child = cmd
        .spawn()
        .map_err(|e| MendError::Tool(format!("command failed: {e}")))?;
    let pid = child.id().map(|p| p as i32).unwrap_or(0);

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let output = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));

    let out_buf = output.clone();
    let stdout_task = tokio::spawn(async move {
        if let Some(ref mut r) = stdout {
            let mut buf = [0u8; 4096];
            loop {
                match r.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => out_buf.lock().unwrap().extend_from_slice(&buf[..n]),
                }
            }
        }
    });
    let err_buf = output.clone();
    let stderr_task = tokio::spawn(async move {
        if let Some(ref mut r) = stderr {
            let mut buf = [0u8; 4096];
            loop {
                match r.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => err_buf.lock().unwrap().extend_from_slice(&buf[..n]),
                }
            }
        }
    });

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut timed_out = false;
    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut deadline => { timed_out = true; None }
        _ = ctx.cancel.cancelled() => { cancelled = true; None }
    };
    if status.is_none() {
        kill_group(pid);
        let _ = child.wait().await;
    }

    let (outstr, oversized) = finish_capture(&output, stdout_task, stderr_task).await;

    if cancelled {
        return Err(MendError::Cancelled(format!(
            "command cancelled\nCommand output (until it was cancelled):\n{outstr}"
        )));
    }
    if timed_out {
        return Err(MendError::Tool(format!(
            "command timed out after {}\nCommand output (until it timed out):\n{outstr}",
            format_duration(timeout)
        )));
    }

    let status = status
        .unwrap()
        .map_err(|e| MendError::Tool(format!("command failed: {e}")))?;
    finish_foreground(status.code(), status.success(), outstr, oversized)
}

async fn execute_foreground_pty(
    ctx: &ToolContext,
    _req: &ShellInput,
    mut cmd: Command,
    timeout: Duration,
) -> Result<String> {
    #[cfg(target_os = "linux")]
    {
        let mut pty = pty::Pty::open()?;
        if let Err(e) = pty.set_winsize(24, 80) {
            warn!(error = %e, "failed to set PTY window size");
        }
        cmd.stdin(Stdio::from(pty.slave_stdio()?))
            .stdout(Stdio::from(pty.slave_stdio()?))
            .stderr(Stdio::from(pty.slave_stdio()?));
        unsafe {
            cmd.pre_exec(|| {
                // New session with the slave (now stdin) as controlling tty.
                libc::setsid();
                libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| MendError::Tool(format!("command failed: {e}")))?;
        let pid = child.id().map(|p| p as i32).unwrap_or(0);

        // Close every parent-side slave handle (the Command keeps its
        // stdio copies until dropped) so the master observes hangup once
        // the child exits.
        drop(cmd);
        pty.close_slave();

        let reader = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            pty.copy_output(&mut out, None);
            (pty, out)
        });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut timed_out = false;
        let mut cancelled = false;
        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut deadline => { timed_out = true; None }
            _ = ctx.cancel.cancelled() => { cancelled = true; None }
        };
        if status.is_none() {
            kill_group(pid);
            let _ = child.wait().await;
        }

        // The child is gone; once our slave handle closes the reader sees
        // hangup. Give delayed output a short grace period.
        let (_pty, out) =
            match tokio::time::timeout(Duration::from_secs(2), reader).await {
                Ok(joined) => joined.map_err(|e| MendError::Tool(format!("PTY reader failed: {e}")))?,
                Err(_) => {
                    warn!("PTY output copying timed out");
                    return Err(MendError::Tool("PTY output copying timed out".to_string()));
                }
            };
        let (outstr, oversized) = render_output(&out);

        if cancelled {
            return Err(MendError::Cancelled(format!(
                "command cancelled\nCommand output (until it was cancelled):\n{outstr}"
            )));
        }
        if timed_out {
            return Err(MendError::Tool(format!(
                "command timed out after {}\nCommand output (until it timed out):\n{outstr}",
                format_duration(timeout)
            )));
        }
        let status = status
            .unwrap()
            .map_err(|e| MendError::Tool(format!("command failed: {e}")))?;
        finish_foreground(status.code(), status.success(), outstr, oversized)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (ctx, cmd, timeout);
        Err(MendError::Tool("PTY not supported on this platform".to_string()))
    }
}

async fn finish_capture(
    output: &Arc<std::sync::Mutex<Vec<u8>>>,
    stdout_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<()>,
) -> (String, bool) {
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    let bytes = output.lock().unwrap();
    render_output(&bytes)
}

/// Apply the oversize cap to captured output. The second value is true
/// when the output was replaced with the size diagnostic.
fn render_output(bytes: &[u8]) -> (String, bool) {
    if bytes.len() > MAX_SHELL_OUTPUT {
        let head = String::from_utf8_lossy(&bytes[..1024]);
        let msg = format!(
            "output too long: got {}, max is {}\ninitial bytes of output:\n{head}",
            humanize_bytes(bytes.len()),
            humanize_bytes(MAX_SHELL_OUTPUT),
        );
        return (msg, true);
    }
    (String::from_utf8_lossy(bytes).to_string(), false)
}

fn finish_foreground(
    code: Option<i32>,
    success: bool,
    outstr: String,
    oversized: bool,
) -> Result<String> {
    if !success {
        let status = match code {
            Some(code) => format!("exit status {code}"),
            None => "killed by signal".to_string(),
        };
        return Err(MendError::Tool(format!("command failed: {status}\n{outstr}")));
    }
    if oversized {
        return Err(MendError::Tool(outstr));
    }
    Ok(outstr)
}

async fn execute_background(
    ctx: &ToolContext,
    req: &ShellInput,
    timeout: Duration,
) -> Result<BackgroundResult> {
    let dir = std::env::temp_dir().join(format!("mend-bg-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    let stdout_path = dir.join("stdout");
    let stderr_path = dir.join("stderr");
    let stdout = std::fs::File::create(&stdout_path)?;
    let stderr = std::fs::File::create(&stderr_path)?;

    let mut cmd = base_command(&req.command, &ctx.working_dir);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    let mut child = cmd
        .spawn()
        .map_err(|e| MendError::Tool(format!("failed to start background command: {e}")))?;
    let pid = child.id().map(|p| p as i32).unwrap_or(0);
    debug!(pid, command = %req.command, "background command started");

    // Reap the child when it exits.
    let kill_pid = pid;
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    // Deadline killer: process group first, then the single pid.
    if !timeout.is_zero() {
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            kill_group(kill_pid);
        });
    }

    Ok(BackgroundResult {
        pid,
        stdout_file: path_string(&stdout_path),
        stderr_file: path_string(&stderr_path),
    })
}

fn path_string(p: &PathBuf) -> String {
    p.to_string_lossy().to_string()
}

pub fn humanize_bytes(bytes: usize) -> String {
    if bytes < 4 * 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{}kB", ((bytes as f64) / 1024.0).round() as usize)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{}MB", ((bytes as f64) / (1024.0 * 1024.0)).round() as usize)
    } else {
        "more than 1GB".to_string()
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_llm::ToolContext;
    use std::time::Instant;

    fn ctx() -> ToolContext {
        ToolContext::new(std::env::temp_dir())
    }

    fn tool() -> ShellTool {
        ShellTool::default()
    }

    async fn run_shell(input: serde_json::Value) -> Result<Vec<ContentBlock>> {
        tool().run(ctx(), input).await
    }

    #[tokio::test]
    async fn echo_hello() {
        let out = run_shell(json!({"command": "echo hello"})).await.unwrap();
        assert_eq!(out[0].text_content(), "hello\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_error_with_output() {
        let err = run_shell(json!({"command": "echo boom >&2; exit 3"}))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit status 3"), "got: {msg}");
        assert!(msg.contains("boom"), "got: {msg}");
    }

    #[tokio::test]
    async fn oversize_output_is_reported() {
        let err = run_shell(json!({"command": "yes | head -c 200000"}))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("tool error: output too long: got 195kB"), "got: {msg}");
        assert!(msg.contains("max is 128kB"), "got: {msg}");
    }

    #[tokio::test]
    async fn timeout_kills_process_group() {
        let shell = ShellTool {
            timeouts: Timeouts {
                fast: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let start = Instant::now();
        let err = shell
            .run(ctx(), json!({"command": "sleep 5"}))
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(4));
        let msg = err.to_string();
        assert!(msg.contains("command timed out after 1s"), "got: {msg}");
    }

    #[tokio::test]
    async fn partial_output_survives_timeout() {
        let shell = ShellTool {
            timeouts: Timeouts {
                fast: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = shell
            .run(ctx(), json!({"command": "echo started; sleep 5"}))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("started"), "got: {msg}");
    }

    #[tokio::test]
    async fn background_returns_pid_and_files() {
        let out = run_shell(json!({"command": "sleep 0.1", "background": true}))
            .await
            .unwrap();
        let result: BackgroundResult = serde_json::from_str(&out[0].text_content()).unwrap();
        assert!(result.pid > 0);
        assert!(std::path::Path::new(&result.stdout_file).exists());
        assert!(std::path::Path::new(&result.stderr_file).exists());
    }

    #[tokio::test]
    async fn background_output_lands_in_files() {
        let out = run_shell(json!({"command": "echo to-file", "background": true}))
            .await
            .unwrap();
        let result: BackgroundResult = serde_json::from_str(&out[0].text_content()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let contents = std::fs::read_to_string(&result.stdout_file).unwrap();
        assert_eq!(contents, "to-file\n");
    }

    #[tokio::test]
    async fn cancellation_kills_command() {
        let shell = tool();
        let mut c = ctx();
        c.cancel = tokio_util::sync::CancellationToken::new();
        let token = c.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
        let start = Instant::now();
        let err = shell
            .run(c, json!({"command": "sleep 10"}))
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(err.is_cancelled(), "got: {err}");
    }

    #[tokio::test]
    async fn dangerous_command_is_refused() {
        let err = run_shell(json!({"command": "rm -rf /"})).await.unwrap_err();
        assert!(matches!(err, MendError::CommandRefused(_)), "got: {err}");
    }

    #[tokio::test]
    async fn permission_callback_is_consulted() {
        let shell = ShellTool {
            check_permission: Some(Arc::new(|cmd: &str| {
                if cmd.contains("curl") {
                    Err(MendError::CommandRefused("no network".to_string()))
                } else {
                    Ok(())
                }
            })),
            ..Default::default()
        };
        let err = shell
            .run(ctx(), json!({"command": "curl example.com"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MendError::CommandRefused(_)));
        let ok = shell.run(ctx(), json!({"command": "echo fine"})).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn pty_mode_runs_with_a_tty() {
        if !pty::is_supported() {
            return;
        }
        let out = run_shell(json!({"command": "tty", "pty": true})).await.unwrap();
        let text = out[0].text_content();
        assert!(text.contains("/dev/pts/"), "got: {text:?}");
    }

    #[test]
    fn humanize() {
        assert_eq!(humanize_bytes(100), "100B");
        assert_eq!(humanize_bytes(200_000), "195kB");
        assert_eq!(humanize_bytes(131072), "128kB");
        assert_eq!(humanize_bytes(5 * 1024 * 1024), "5MB");
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(1)), "1s");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(900)), "15m");
        assert_eq!(format_duration(Duration::from_secs(86_400)), "24h");
    }
}
