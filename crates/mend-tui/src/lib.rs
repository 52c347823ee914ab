//! Raw-mode terminal UI for the agent.
//!
//! A single writer task owns stdout: messages from the fan-out and lines
//! typed by the user are interleaved above a persistent prompt showing
//! the session URL and spend.

pub mod render;

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::{Arc, Mutex};

use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use mend_agent::CodingAgent;
use mend_core::{MendError, MessageKind, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use render::{render_message, render_prompt};

const HELP: &str = "General use:
Use chat to ask mend to tackle a task or answer a question about this repo.

Special commands:
- help, ?             : Show this help message
- budget              : Show original budget
- usage, cost         : Show current token usage and cost
- browser, open, b    : Open current conversation in browser
- stop, cancel, abort : Cancel the current operation
- compact             : Compress conversation history to reduce context size
- exit, quit, q       : Exit mend
- ! <command>         : Execute a shell command (e.g. !ls -la)";

/// What a line of user input asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Budget,
    Usage,
    Browser,
    Stop,
    Compact,
    Exit,
    Panic,
    /// A local shell command; `forward` also sends it and its output to
    /// the agent.
    Shell { cmd: String, forward: bool },
    Chat(String),
    Empty,
}

/// Classify one line of input.
pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    match line {
        "" => Command::Empty,
        "?" | "help" => Command::Help,
        "budget" => Command::Budget,
        "usage" | "cost" => Command::Usage,
        "browser" | "open" | "b" => Command::Browser,
        "stop" | "cancel" | "abort" => Command::Stop,
        "compact" => Command::Compact,
        "bye" | "exit" | "q" | "quit" => Command::Exit,
        "panic" => Command::Panic,
        _ => {
            if let Some(rest) = line.strip_prefix('!') {
                let forward = rest.starts_with('!');
                let cmd = rest.strip_prefix('!').unwrap_or(rest).trim().to_string();
                Command::Shell { cmd, forward }
            } else {
                Command::Chat(line.to_string())
            }
        }
    }
}

/// RAII guard restoring cooked mode on drop, including on panic.
struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        enable_raw_mode().map_err(|e| MendError::Other(format!("failed to enable raw mode: {e}")))?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

pub struct TermUI {
    agent: Arc<dyn CodingAgent>,
    http_url: String,
    pushed_branches: Mutex<BTreeSet<String>>,
}

impl TermUI {
    pub fn new(agent: Arc<dyn CodingAgent>, http_url: impl Into<String>) -> Self {
        Self {
            agent,
            http_url: http_url.into(),
            pushed_branches: Mutex::new(BTreeSet::new()),
        }
    }

    fn prompt(&self, thinking: bool) -> String {
        render_prompt(
            &self.http_url,
            self.agent.total_usage().total_cost_usd,
            self.agent.original_budget().max_dollars,
            thinking,
        )
    }

    /// Print above the prompt; newlines become CRLF for raw mode.
    fn print(&self, text: &str) {
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "\r\x1b[2K{}\r\n", text.replace('\n', "\r\n"));
        let _ = stdout.flush();
    }

    fn redraw(&self, thinking: bool, input: &str) {
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "\r\x1b[2K{}{}", self.prompt(thinking), input);
        let _ = stdout.flush();
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        println!("🌐 {}/", self.http_url);
        println!("💬 type 'help' for help");
        println!();

        let _guard = RawModeGuard::new()?;

        // Keyboard events come off a blocking reader thread.
        let (key_tx, mut key_rx) = mpsc::unbounded_channel::<KeyEvent>();
        let key_shutdown = shutdown.clone();
        std::thread::spawn(move || loop {
            if key_shutdown.is_cancelled() {
                return;
            }
            match crossterm::event::poll(std::time::Duration::from_millis(100)) {
                Ok(true) => match crossterm::event::read() {
                    Ok(Event::Key(key)) => {
                        if key_tx.send(key).is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => return,
                },
                Ok(false) => {}
                Err(_) => return,
            }
        });

        let mut iter = self.agent.new_iterator(0);
        let mut input = String::new();
        let mut thinking = false;
        self.redraw(thinking, &input);

        loop {
            tokio::select! {
                msg = iter.next() => {
                    let Some(msg) = msg else { break };
                    if msg.hide_output {
                        continue;
                    }
                    // A user message starts the thinking indicator; a
                    // top-level end of turn stops it.
                    thinking = !(msg.end_of_turn && msg.parent_conversation_id.is_none());
                    if msg.kind == MessageKind::Commit {
                        let mut pushed = self.pushed_branches.lock().unwrap();
                        for commit in &msg.commits {
                            if let Some(branch) = &commit.pushed_branch {
                                pushed.insert(branch.clone());
                            }
                        }
                    }
                    if let Some(line) = render_message(&msg) {
                        if !line.trim().is_empty() {
                            self.print(&line);
                        }
                    }
                    self.redraw(thinking, &input);
                }
                key = key_rx.recv() => {
                    let Some(key) = key else { break };
                    match (key.code, key.modifiers) {
                        (KeyCode::Char('c'), KeyModifiers::CONTROL) => {
                            self.agent.cancel_turn("user canceled the operation".to_string());
                        }
                        (KeyCode::Char('d'), KeyModifiers::CONTROL) if input.is_empty() => {
                            self.print("");
                            self.finish();
                            return Ok(());
                        }
                        (KeyCode::Enter, _) => {
                            let line = std::mem::take(&mut input);
                            self.print(&format!("{}{line}", self.prompt(thinking)));
                            if self.handle_line(&line) {
                                self.finish();
                                return Ok(());
                            }
                            self.redraw(thinking, &input);
                        }
                        (KeyCode::Backspace, _) => {
                            input.pop();
                            self.redraw(thinking, &input);
                        }
                        (KeyCode::Char(c), m) if m.is_empty() || m == KeyModifiers::SHIFT => {
                            input.push(c);
                            self.redraw(thinking, &input);
                        }
                        _ => {}
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        Ok(())
    }

    /// Handle one submitted line; returns true to exit.
    fn handle_line(&self, line: &str) -> bool {
        match parse_command(line) {
            Command::Empty => {}
            Command::Help => self.print(HELP),
            Command::Budget => {
                let budget = self.agent.original_budget();
                self.print("💰 Budget summary:");
                if budget.max_responses > 0 {
                    self.print(&format!("- Max responses: {}", budget.max_responses));
                }
                if !budget.max_wall_time.is_zero() {
                    self.print(&format!("- Max wall time: {:?}", budget.max_wall_time));
                }
                self.print(&format!("- Max total cost: {:.2}", budget.max_dollars));
            }
            Command::Usage => self.print_usage("💰 Current usage summary:"),
            Command::Browser => {
                self.print(&format!("🌐 Open {} in your browser", self.http_url));
            }
            Command::Stop => {
                self.agent.cancel_turn("user canceled the operation".to_string());
            }
            Command::Compact => {
                let bytes = self.agent.compact_conversation();
                self.print(&format!("🧹 compacted {bytes} bytes of history"));
            }
            Command::Panic => panic!("user forced a panic"),
            Command::Exit => return true,
            Command::Shell { cmd, forward } => {
                debug!(cmd = %cmd, forward, "local shell command");
                let output = std::process::Command::new("bash")
                    .arg("-c")
                    .arg(&cmd)
                    .output();
                match output {
                    Ok(out) => {
                        let mut text = String::from_utf8_lossy(&out.stdout).to_string();
                        text.push_str(&String::from_utf8_lossy(&out.stderr));
                        self.print(&text);
                        if !out.status.success() {
                            self.print(&format!("❌ Command error: {}", out.status));
                        }
                        if forward {
                            let message = format!(
                                "I ran the command: `{cmd}`\nOutput:\n```\n{text}```"
                            );
                            self.agent.user_message(message);
                        }
                    }
                    Err(e) => self.print(&format!("❌ Command error: {e}")),
                }
            }
            Command::Chat(text) => self.agent.user_message(text),
        }
        false
    }

    fn print_usage(&self, header: &str) {
        let usage = self.agent.total_usage();
        self.print(header);
        self.print(&format!("- Input tokens: {}", usage.total_input_tokens()));
        self.print(&format!("- Output tokens: {}", usage.output_tokens));
        self.print(&format!("- Responses: {}", usage.responses));
        self.print(&format!("- Wall time: {:.0?}", usage.wall_time));
        self.print(&format!("- Total cost: ${:.2}", usage.total_cost_usd));
    }

    /// Final summary: usage, pushed branches, and how to use them.
    fn finish(&self) {
        self.print_usage("💰 Final usage summary:");
        let pushed = self.pushed_branches.lock().unwrap();
        if !pushed.is_empty() {
            let initial = self.agent.initial_commit();
            let short = &initial[..initial.len().min(8)];
            if pushed.len() == 1 {
                let branch = pushed.iter().next().unwrap();
                self.print(&format!("\n🔄 Branch pushed during session: {branch}"));
                self.print(&format!(
                    "🍒 Cherry-pick those changes: git cherry-pick {short}..{branch}"
                ));
                self.print(&format!("🔀 Merge those changes:       git merge {branch}"));
                self.print(&format!("🗑️  Delete the branch:         git branch -D {branch}"));
            } else {
                self.print("\n🔄 Branches pushed during session:");
                for branch in pushed.iter() {
                    self.print(&format!("- {branch}"));
                }
                self.print("\n🍒 To add all those changes to your branch:");
                for branch in pushed.iter() {
                    self.print(&format!("git cherry-pick {short}..{branch}"));
                }
                self.print("\n🗑️  To delete branches:");
                for branch in pushed.iter() {
                    self.print(&format!("git branch -D {branch}"));
                }
            }
        }
        self.print("\n👋 Goodbye!");
    }
}
