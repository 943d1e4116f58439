//! `run_command`: shell execution inside the working directory.
//!
//! Output is stdout followed by stderr, truncated at 64KB. A non-zero exit
//! code is reported as data, not as an error.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Commands that are always refused.
const BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    ":(){ :|:& };:",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
    "> /dev/sda",
    "shutdown",
    "reboot",
];

#[derive(Debug)]
pub struct RunCommandTool {
    working_dir: PathBuf,
    timeout: Duration,
}

impl RunCommandTool {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn is_blocked(cmd: &str) -> bool {
        let normalized = cmd.to_lowercase();
        BLOCKED_PATTERNS.iter().any(|p| normalized.contains(p))
    }

    async fn run(&self, cmd: &str) -> Result<(String, i32), ToolError> {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", cmd]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", cmd]);
            c
        };

        command
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to spawn command: {e}")))?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::Timeout(self.timeout))?
            .map_err(|e| ToolError::ExecutionFailed(format!("Command execution failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.into_owned()
        } else if stdout.is_empty() {
            stderr.into_owned()
        } else {
            format!("{stdout}\n--- stderr ---\n{stderr}")
        };

        Ok((truncate_output(&combined), output.status.code().unwrap_or(-1)))
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory and return its combined \
         stdout/stderr and exit code. Use for builds, tests and inspection. \
         Commands are killed after a timeout."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let command = require_str(&params, "command")?;
        if Self::is_blocked(command) {
            return Err(ToolError::NotAuthorized(format!(
                "Command contains blocked pattern: {}",
                truncate_for_error(command)
            )));
        }

        let start = std::time::Instant::now();
        let (output, exit_code) = self.run(command).await?;
        tracing::debug!(
            task_id = %ctx.task_id,
            exit_code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "run_command finished"
        );

        Ok(ToolOutput::success(
            serde_json::json!({
                "output": output,
                "exit_code": exit_code,
                "success": exit_code == 0,
            }),
            start.elapsed(),
        ))
    }
}

/// Truncate at `MAX_OUTPUT_SIZE` bytes on a char boundary.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n\n... [truncated, {} bytes total]",
        &s[..end],
        s.len()
    )
}

fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> ToolContext {
        ToolContext::for_task("T1")
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let tool = RunCommandTool::new(dir.path());

        let out = tool
            .execute(serde_json::json!({"command": "echo hello"}), &ctx())
            .await
            .unwrap();
        assert!(out.result["output"].as_str().unwrap().contains("hello"));
        assert_eq!(out.result["exit_code"], 0);

        let out = tool
            .execute(serde_json::json!({"command": "echo oops >&2; exit 3"}), &ctx())
            .await
            .unwrap();
        assert!(out.result["output"].as_str().unwrap().contains("oops"));
        assert_eq!(out.result["exit_code"], 3);
        assert_eq!(out.result["success"], false);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = RunCommandTool::new(dir.path())
            .execute(serde_json::json!({"command": "ls"}), &ctx())
            .await
            .unwrap();
        assert!(out.result["output"].as_str().unwrap().contains("marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn times_out() {
        let dir = TempDir::new().unwrap();
        let tool = RunCommandTool::new(dir.path()).with_timeout(Duration::from_millis(100));
        let err = tool
            .execute(serde_json::json!({"command": "sleep 5"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn blocked_commands_are_refused() {
        let dir = TempDir::new().unwrap();
        let err = RunCommandTool::new(dir.path())
            .execute(serde_json::json!({"command": "sudo rm -rf / "}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotAuthorized(_)));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(MAX_OUTPUT_SIZE);
        let out = truncate_output(&s);
        assert!(out.contains("[truncated"));
        assert!(out.len() < s.len());
    }
}
