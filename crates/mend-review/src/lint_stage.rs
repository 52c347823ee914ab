//! Lint regression detection over `cargo clippy --message-format json`.
//!
//! Issues are compared by message text, not position, so that line and
//! column drift between commits does not produce false regressions.

use std::collections::BTreeMap;
use std::path::Path;

use mend_core::{MendError, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::warn;

use crate::packages::package_name_from_id;

/// A single lint issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintIssue {
    /// `file:line:col`, informational only; never used for matching.
    pub position: String,
    pub message: String,
}

/// package -> category (lint code) -> issues. BTreeMaps keep reports
/// deterministic.
pub type LintResults = BTreeMap<String, BTreeMap<String, Vec<LintIssue>>>;

#[derive(Deserialize)]
struct ClippyLine {
    reason: String,
    #[serde(default)]
    package_id: String,
    #[serde(default)]
    message: Option<Diagnostic>,
}

#[derive(Deserialize)]
struct Diagnostic {
    #[serde(default)]
    level: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<DiagnosticCode>,
    #[serde(default)]
    spans: Vec<Span>,
}

#[derive(Deserialize)]
struct DiagnosticCode {
    code: String,
}

#[derive(Deserialize)]
struct Span {
    file_name: String,
    line_start: u64,
    column_start: u64,
    #[serde(default)]
    is_primary: bool,
}

/// Run clippy over the given packages; parse failures are non-fatal and
/// yield an empty result.
pub async fn run_lints(dir: &Path, packages: &[String]) -> Result<LintResults> {
    if packages.is_empty() {
        return Ok(LintResults::new());
    }
    let mut args: Vec<String> = vec!["clippy".into(), "--message-format".into(), "json".into()];
    for pkg in packages {
        args.push("-p".into());
        args.push(pkg.clone());
    }
    let out = Command::new("cargo")
        .args(&args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| MendError::Review(format!("failed to run cargo clippy: {e}")))?;
    if !out.status.success() && out.stdout.is_empty() {
        warn!(
            stderr = %String::from_utf8_lossy(&out.stderr),
            "cargo clippy failed to run"
        );
        return Ok(LintResults::new());
    }
    Ok(parse_lint_output(&out.stdout))
}

/// Parse clippy's JSON stream into per-package, per-category issues.
pub fn parse_lint_output(output: &[u8]) -> LintResults {
    let mut results = LintResults::new();
    for line in String::from_utf8_lossy(output).lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<ClippyLine>(line) else {
            continue;
        };
        if parsed.reason != "compiler-message" {
            continue;
        }
        let Some(diag) = parsed.message else { continue };
        if diag.level != "warning" && diag.level != "error" {
            continue;
        }
        // Summary lines like "3 warnings emitted" carry no code.
        let Some(code) = diag.code else { continue };
        let position = diag
            .spans
            .iter()
            .find(|s| s.is_primary)
            .or_else(|| diag.spans.first())
            .map(|s| format!("{}:{}:{}", s.file_name, s.line_start, s.column_start))
            .unwrap_or_default();
        let package = package_name_from_id(&parsed.package_id);
        results
            .entry(package)
            .or_default()
            .entry(code.code)
            .or_default()
            .push(LintIssue {
                position,
                message: diag.message,
            });
    }
    results
}

pub fn has_issues(results: &LintResults) -> bool {
    results
        .values()
        .any(|cats| cats.values().any(|issues| !issues.is_empty()))
}

fn position_file(position: &str) -> &str {
    position.split(':').next().unwrap_or(position)
}

fn messages_similar(a: &str, b: &str) -> bool {
    a.contains(b) || b.contains(a)
}

/// True when `issue` already existed among `existing`, compared without
/// positions; a same-file substring match also counts.
fn issue_exists_in(issue: &LintIssue, existing: &[LintIssue]) -> bool {
    let issue_file = position_file(&issue.position);
    for prior in existing {
        if issue.message == prior.message {
            return true;
        }
        if issue_file == position_file(&prior.position)
            && messages_similar(&issue.message, &prior.message)
        {
            return true;
        }
    }
    false
}

/// Issues present after but not before.
pub fn find_lint_regressions(before: &LintResults, after: &LintResults) -> LintResults {
    let mut regressions = LintResults::new();

    for (package, after_categories) in after {
        let Some(before_categories) = before.get(package) else {
            // The package is new; all its issues are new.
            regressions.insert(package.clone(), after_categories.clone());
            continue;
        };
        for (category, after_issues) in after_categories {
            let Some(before_issues) = before_categories.get(category) else {
                regressions
                    .entry(package.clone())
                    .or_default()
                    .insert(category.clone(), after_issues.clone());
                continue;
            };
            let new_issues: Vec<LintIssue> = after_issues
                .iter()
                .filter(|issue| !issue_exists_in(issue, before_issues))
                .cloned()
                .collect();
            if !new_issues.is_empty() {
                regressions
                    .entry(package.clone())
                    .or_default()
                    .insert(category.clone(), new_issues);
            }
        }
    }

    regressions
}

/// Numbered, deterministic report; empty when there are no regressions.
pub fn format_lint_regressions(regressions: &LintResults) -> String {
    if !has_issues(regressions) {
        return String::new();
    }
    let mut out = String::from("Lint issues detected:\n\n");
    let mut n = 1usize;
    for categories in regressions.values() {
        for (category, issues) in categories {
            let mut issues = issues.clone();
            issues.sort_by(|a, b| a.position.cmp(&b.position));
            for issue in issues {
                out.push_str(&format!(
                    "{n}. [{category}] {}: {}\n",
                    issue.position, issue.message
                ));
                n += 1;
            }
        }
    }
    out.push_str("\nPlease fix these issues before proceeding.");
    out
}
