//! Language-server diagnostics stage.
//!
//! Shells out to `rust-analyzer diagnostics` over the project and keeps
//! only issues in the changed files. When the tool is unavailable or its
//! output does not look like diagnostics, the stage skips gracefully
//! rather than failing the review.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use mend_core::Result;
use tokio::process::Command;
use tracing::warn;

/// One analyzer issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerIssue {
    /// `file:line:col`, informational only.
    pub position: String,
    pub message: String,
}

/// Run the analyzer over `dir`, keeping issues in `changed_files`.
///
/// Returns None when the analyzer could not run; the caller then skips
/// this stage entirely.
pub async fn run_analyzer(dir: &Path, changed_files: &[PathBuf]) -> Result<Option<Vec<AnalyzerIssue>>> {
    let rust_files: Vec<&PathBuf> = changed_files
        .iter()
        .filter(|f| f.extension().map(|e| e == "rs").unwrap_or(false))
        .filter(|f| f.exists())
        .collect();
    if rust_files.is_empty() {
        return Ok(None);
    }

    let out = match Command::new("rust-analyzer")
        .args(["diagnostics", "."])
        .current_dir(dir)
        .output()
        .await
    {
        Ok(out) => out,
        Err(e) => {
            warn!(error = %e, "rust-analyzer failed to start, skipping diagnostics stage");
            return Ok(None);
        }
    };

    let combined = [out.stdout.as_slice(), out.stderr.as_slice()].concat();
    if !out.status.success() && !looks_like_diagnostics(&combined) {
        warn!("rust-analyzer check failed to run properly, skipping diagnostics stage");
        return Ok(None);
    }

    let changed: BTreeSet<String> = rust_files
        .iter()
        .filter_map(|f| f.strip_prefix(dir).ok().or(Some(f.as_path())))
        .map(|f| f.to_string_lossy().to_string())
        .collect();

    let issues = parse_analyzer_output(&combined)
        .into_iter()
        .filter(|issue| {
            let file = position_file(&issue.position);
            changed.iter().any(|c| file.ends_with(c.as_str()) || c.ends_with(file))
        })
        .collect();
    Ok(Some(issues))
}

/// True when the output has at least one `file.rs:line:col: message` line.
pub fn looks_like_diagnostics(output: &[u8]) -> bool {
    if output.is_empty() {
        return false;
    }
    String::from_utf8_lossy(output)
        .lines()
        .any(|line| parse_diagnostic_line(line.trim()).is_some())
}

/// Parse lines of the form `path/to/file.rs:10:5: some message`.
pub fn parse_analyzer_output(output: &[u8]) -> Vec<AnalyzerIssue> {
    String::from_utf8_lossy(output)
        .lines()
        .filter_map(|line| parse_diagnostic_line(line.trim()))
        .collect()
}

fn parse_diagnostic_line(line: &str) -> Option<AnalyzerIssue> {
    if line.is_empty()
        || line.starts_with("Error:")
        || line.starts_with("Failed:")
        || line.starts_with("Warning:")
        || line.starts_with("processing crate")
    {
        return None;
    }
    let sep = line.find(": ")?;
    let (position, message) = line.split_at(sep);
    let message = &message[2..];
    // Position must name a Rust file and carry line:col information.
    let first_colon = position.find(':')?;
    if !position[..first_colon].ends_with(".rs") {
        return None;
    }
    if position.matches(':').count() < 2 {
        return None;
    }
    Some(AnalyzerIssue {
        position: position.to_string(),
        message: message.to_string(),
    })
}

fn position_file(position: &str) -> &str {
    position.split(':').next().unwrap_or(position)
}

/// General category of an issue: the message up to its first colon.
fn general_category(message: &str) -> &str {
    match message.find(':') {
        Some(idx) if idx > 0 => &message[..idx],
        _ => message,
    }
}

/// Issues present after but not before, compared per file by exact
/// message and then by general category.
pub fn find_analyzer_regressions(
    before: &[AnalyzerIssue],
    after: &[AnalyzerIssue],
) -> Vec<AnalyzerIssue> {
    let mut known: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for issue in before {
        let entry = known.entry(position_file(&issue.position)).or_default();
        entry.insert(&issue.message);
        entry.insert(general_category(&issue.message));
    }

    let mut regressions: Vec<AnalyzerIssue> = after
        .iter()
        .filter(|issue| {
            let Some(entries) = known.get(position_file(&issue.position)) else {
                return true;
            };
            !entries.contains(issue.message.as_str())
                && !entries.contains(general_category(&issue.message))
        })
        .cloned()
        .collect();
    regressions.sort_by(|a, b| a.position.cmp(&b.position));
    regressions
}

/// Numbered report; empty when there are no regressions.
pub fn format_analyzer_regressions(regressions: &[AnalyzerIssue]) -> String {
    if regressions.is_empty() {
        return String::new();
    }
    let mut out = String::from("Analyzer diagnostics detected:\n\n");
    for (i, issue) in regressions.iter().enumerate() {
        out.push_str(&format!("{}. {}: {}\n", i + 1, issue.position, issue.message));
    }
    out.push_str(
        "\nIMPORTANT: Only fix new analyzer issues in parts of the code that you have \
         already edited. Do not change existing code that was not part of your current edits.",
    );
    out
}
