//! Test regression detection.
//!
//! Runs the test suite in JSON-event mode at HEAD and, only when failures
//! appear, again at the base worktree; a regression is any test whose
//! after-status is strictly worse than its before-status.

use std::collections::BTreeMap;
use std::path::Path;

use mend_core::{MendError, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::packages::package_name_from_id;

/// Status of one test at one commit, ordered by badness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestStatus {
    Unknown,
    Pass,
    Skip,
    Fail,
    BuildFail,
}

/// Identifies one test (or a whole package when `test` is empty).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestInfo {
    pub package: String,
    pub test: String,
}

impl std::fmt::Display for TestInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.test.is_empty() {
            write!(f, "{}", self.package)
        } else {
            write!(f, "{}::{}", self.package, self.test)
        }
    }
}

/// One parsed event from the combined cargo/libtest JSON stream, tagged
/// with the package it ran in.
#[derive(Debug, Clone)]
pub struct TestEvent {
    pub package: String,
    pub kind: TestEventKind,
}

#[derive(Debug, Clone)]
pub enum TestEventKind {
    /// libtest: one test finished.
    Test {
        name: String,
        status: TestStatus,
        output: String,
    },
    /// cargo: a compiler error makes the whole package a build failure.
    BuildError,
}

/// A test that regressed between the base commit and HEAD.
#[derive(Debug, Clone)]
pub struct TestRegression {
    pub info: TestInfo,
    pub before: TestStatus,
    pub after: TestStatus,
    pub output: String,
}

/// libtest JSON event line.
#[derive(Deserialize)]
struct LibtestLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    stdout: String,
}

/// cargo JSON message line (only the parts we read).
#[derive(Deserialize)]
struct CargoLine {
    reason: String,
    #[serde(default)]
    package_id: String,
    #[serde(default)]
    message: Option<CargoDiagnostic>,
}

#[derive(Deserialize)]
struct CargoDiagnostic {
    #[serde(default)]
    level: String,
}

/// Run the test suite for one package; output is the raw JSON stream.
pub async fn run_package_tests(dir: &Path, package: &str) -> Result<(Vec<u8>, bool)> {
    let out = Command::new("cargo")
        .args([
            "test",
            "--message-format",
            "json",
            "--no-fail-fast",
            "-p",
            package,
            "--",
            "-Zunstable-options",
            "--format=json",
        ])
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| MendError::Review(format!("failed to run cargo test: {e}")))?;
    Ok((out.stdout, out.status.success()))
}

/// Run tests for every impacted package and collect tagged events.
pub async fn run_tests(dir: &Path, packages: &[String]) -> Result<(Vec<TestEvent>, bool)> {
    let mut events = Vec::new();
    let mut all_passed = true;
    for package in packages {
        let (stdout, success) = run_package_tests(dir, package).await?;
        if !success {
            all_passed = false;
        }
        events.extend(parse_test_events(package, &stdout));
    }
    Ok((events, all_passed))
}

/// Parse the line-oriented union of cargo build messages and libtest
/// events. Unrecognized lines are ignored.
pub fn parse_test_events(package: &str, output: &[u8]) -> Vec<TestEvent> {
    let mut events = Vec::new();
    for line in String::from_utf8_lossy(output).lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(cargo) = serde_json::from_str::<CargoLine>(line) {
            if cargo.reason == "compiler-message"
                && cargo.message.map(|m| m.level == "error").unwrap_or(false)
            {
                let pkg = if cargo.package_id.is_empty() {
                    package.to_string()
                } else {
                    package_name_from_id(&cargo.package_id)
                };
                events.push(TestEvent {
                    package: pkg,
                    kind: TestEventKind::BuildError,
                });
            }
            continue;
        }
        if let Ok(lt) = serde_json::from_str::<LibtestLine>(line) {
            if lt.kind != "test" {
                continue;
            }
            let status = match lt.event.as_str() {
                "ok" => TestStatus::Pass,
                "failed" => TestStatus::Fail,
                "ignored" => TestStatus::Skip,
                _ => continue, // "started" and friends
            };
            events.push(TestEvent {
                package: package.to_string(),
                kind: TestEventKind::Test {
                    name: lt.name,
                    status,
                    output: lt.stdout,
                },
            });
        }
    }
    events
}

/// Fold events into the worst observed status per test.
pub fn collect_statuses(events: &[TestEvent]) -> BTreeMap<TestInfo, TestStatus> {
    let mut statuses: BTreeMap<TestInfo, TestStatus> = BTreeMap::new();
    let mut failed_builds: Vec<&str> = Vec::new();

    for event in events {
        if matches!(event.kind, TestEventKind::BuildError) {
            failed_builds.push(&event.package);
        }
    }

    for event in events {
        if let TestEventKind::Test { name, status, .. } = &event.kind {
            let info = TestInfo {
                package: event.package.clone(),
                test: name.clone(),
            };
            let status = if failed_builds.contains(&event.package.as_str()) {
                TestStatus::BuildFail
            } else {
                *status
            };
            let entry = statuses.entry(info).or_insert(TestStatus::Unknown);
            if status > *entry {
                *entry = status;
            }
        }
    }

    // A package that failed to build may have produced no test events at
    // all; record the failure at package granularity.
    for package in failed_builds {
        let info = TestInfo {
            package: package.to_string(),
            test: String::new(),
        };
        statuses.entry(info).or_insert(TestStatus::BuildFail);
    }

    statuses
}

/// A regression is an increase in badness.
pub fn is_regression(before: TestStatus, after: TestStatus) -> bool {
    after > before
}

/// Failure output per test in the after state.
pub fn collect_outputs(events: &[TestEvent]) -> BTreeMap<TestInfo, String> {
    let mut outputs = BTreeMap::new();
    for event in events {
        if let TestEventKind::Test { name, output, .. } = &event.kind {
            if output.is_empty() {
                continue;
            }
            let info = TestInfo {
                package: event.package.clone(),
                test: name.clone(),
            };
            outputs
                .entry(info)
                .and_modify(|o: &mut String| o.push_str(output))
                .or_insert_with(|| output.clone());
        }
    }
    outputs
}

/// Identify tests that regressed between the two event sets, sorted by
/// (package, test) for deterministic output.
pub fn compare_test_results(before: &[TestEvent], after: &[TestEvent]) -> Vec<TestRegression> {
    let before_statuses = collect_statuses(before);
    let after_statuses = collect_statuses(after);
    let outputs = collect_outputs(after);

    let mut regressions = Vec::new();
    for (info, after_status) in &after_statuses {
        if matches!(after_status, TestStatus::Pass | TestStatus::Skip) {
            continue;
        }
        let before_status = before_statuses
            .get(info)
            .copied()
            .unwrap_or(TestStatus::Unknown);
        if is_regression(before_status, *after_status) {
            regressions.push(TestRegression {
                info: info.clone(),
                before: before_status,
                after: *after_status,
                output: outputs.get(info).cloned().unwrap_or_default(),
            });
        }
    }
    regressions.sort_by(|a, b| a.info.cmp(&b.info));
    regressions
}

const MAX_OUTPUT_LINES: usize = 10;

/// Human-readable regression report; empty when there are none.
pub fn format_test_regressions(initial_commit: &str, regressions: &[TestRegression]) -> String {
    if regressions.is_empty() {
        return String::new();
    }

    let mut out = format!(
        "Test regressions detected between initial commit ({initial_commit}) and HEAD:\n\n"
    );
    for (i, reg) in regressions.iter().enumerate() {
        out.push_str(&format!("{}. {}: ", i + 1, reg.info));
        let description = match (reg.before, reg.after) {
            (TestStatus::Unknown, TestStatus::Fail) => "New test is failing",
            (TestStatus::Unknown, TestStatus::BuildFail) => "New test has build errors",
            (TestStatus::Pass, TestStatus::Fail) => "Was passing, now failing",
            (TestStatus::Pass, TestStatus::BuildFail) => "Was passing, now has build errors",
            (TestStatus::Skip, TestStatus::Fail) => "Was skipped, now failing",
            (TestStatus::Skip, TestStatus::BuildFail) => "Was skipped, now has build errors",
            _ => "Regression detected",
        };
        out.push_str(description);
        out.push('\n');

        if !reg.output.is_empty() {
            let lines: Vec<&str> = reg.output.trim().lines().collect();
            let shown = lines.len().min(MAX_OUTPUT_LINES);
            out.push_str("   Output:\n");
            for line in &lines[..shown] {
                out.push_str(&format!("   | {line}\n"));
            }
            if shown < lines.len() {
                out.push_str(&format!("   | ... ({} more lines)\n", lines.len() - shown));
            }
        }
        out.push('\n');
    }
    out.push_str("Please fix these test failures before proceeding.");
    debug!(regressions = regressions.len(), "formatted test regressions");
    out
}
