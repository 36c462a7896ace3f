//! Post-run verification: shell commands run in the project root, each under
//! its own timeout.

use crate::agent::TaskOutcome;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use strip_ansi_escapes::strip_str;
use tokio::process::Command;
use tracing::{debug, warn};

const MAX_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub status: CheckStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checks {
    pub assistant_message_present: bool,
    pub tool_steps_recorded: bool,
    pub changes_detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkspaceSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub checks: Checks,
    pub commands: Vec<CommandReport>,
    pub workspace_summary: WorkspaceSummary,
}

/// Runs `commands` in order and summarizes them together with checks on the
/// task outcome. Anything but a zero exit counts as failed.
pub async fn verify(root: &Path, commands: &[String], timeout: Duration, outcome: &TaskOutcome) -> Verification {
    let mut reports = Vec::with_capacity(commands.len());
    for command in commands.iter().filter(|c| !c.trim().is_empty()) {
        reports.push(run_command(root, command, timeout).await);
    }
    let passed = reports
        .iter()
        .filter(|r| r.status == CheckStatus::Passed)
        .count();

    Verification {
        checks: Checks {
            assistant_message_present: !outcome.assistant_message.trim().is_empty(),
            tool_steps_recorded: outcome.tool_steps > 0,
            changes_detected: !outcome.applied_files.is_empty() || !outcome.pending_changes.is_empty(),
        },
        workspace_summary: WorkspaceSummary {
            total: reports.len(),
            passed,
            failed: reports.len() - passed,
        },
        commands: reports,
    }
}

/// Runs one command through `sh -c`. The child is killed if the timeout fires.
pub async fn run_command(root: &Path, command: &str, timeout: Duration) -> CommandReport {
    let started = Instant::now();
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let report = |status, exit_code, stdout: String, stderr: String| CommandReport {
        command: command.to_string(),
        status,
        exit_code,
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => {
            let status = if output.status.success() {
                CheckStatus::Passed
            } else {
                CheckStatus::Failed
            };
            debug!(command, ?status, "verification command finished");
            report(
                status,
                output.status.code(),
                clean_output(&output.stdout),
                clean_output(&output.stderr),
            )
        }
        Ok(Err(e)) => {
            warn!(command, error = %e, "verification command could not run");
            report(CheckStatus::Error, None, String::new(), e.to_string())
        }
        Err(_) => {
            warn!(command, timeout_secs = timeout.as_secs(), "verification command timed out");
            report(
                CheckStatus::Timeout,
                None,
                String::new(),
                format!("timed out after {}s", timeout.as_secs()),
            )
        }
    }
}

fn clean_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    strip_str(&text).chars().take(MAX_OUTPUT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::Builder;

    fn outcome() -> TaskOutcome {
        TaskOutcome {
            chat_id: None,
            chat_title: None,
            model_id: "m".into(),
            assistant_message: "done".into(),
            applied_files: vec!["a.py".into()],
            pending_id: None,
            pending_changes: Vec::new(),
            tool_steps: 0,
            fallback_used: false,
        }
    }

    #[tokio::test]
    async fn test_statuses_and_summary() {
        let tmp_dir = Builder::new().prefix("test-verify").tempdir().unwrap();
        std::fs::write(tmp_dir.path().join("marker.txt"), "here").unwrap();
        let commands = vec![
            "cat marker.txt".to_string(),
            "printf '\\033[31mred\\033[0m' >&2; exit 3".to_string(),
            "sleep 5".to_string(),
            "  ".to_string(),
        ];
        let verification = verify(tmp_dir.path(), &commands, Duration::from_millis(500), &outcome()).await;

        assert_eq!(
            verification.workspace_summary,
            WorkspaceSummary {
                total: 3,
                passed: 1,
                failed: 2
            }
        );
        let [ok, failed, slow] = &verification.commands[..] else {
            panic!("expected three reports");
        };
        assert_eq!(ok.stdout, "here");
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(failed.status, CheckStatus::Failed);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.stderr, "red");
        assert_eq!(slow.status, CheckStatus::Timeout);

        assert!(verification.checks.assistant_message_present);
        assert!(!verification.checks.tool_steps_recorded);
        assert!(verification.checks.changes_detected);
    }

    #[test]
    fn test_output_is_clipped() {
        let long = "x".repeat(MAX_OUTPUT_CHARS + 10);
        assert_eq!(clean_output(long.as_bytes()).len(), MAX_OUTPUT_CHARS);
    }
}
