//! Subprocess execution with timeout kill and captured streams.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Result of one subprocess run.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Exit code; 124 when the process was killed on timeout.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    /// Spawn failure (missing binary, permissions), not a non-zero exit.
    pub spawn_error: Option<String>,
}

impl CommandOutcome {
    pub fn ok(&self) -> bool {
        !self.timed_out && self.spawn_error.is_none() && self.exit_code == 0
    }

    fn spawn_failed(error: String, duration_ms: u64) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms,
            timed_out: false,
            spawn_error: Some(error),
        }
    }
}

/// Execute `argv` in `cwd`, feeding `stdin_data` when given, killing the
/// process after `timeout_ms`.
pub async fn run_command(
    argv: &[String],
    cwd: &Path,
    timeout_ms: u64,
    stdin_data: Option<&str>,
) -> CommandOutcome {
    let start = Instant::now();
    if argv.is_empty() {
        return CommandOutcome::spawn_failed("empty command".to_string(), 0);
    }

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(cwd)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let tag = if e.kind() == std::io::ErrorKind::NotFound {
                format!("missing_binary: {}", argv[0])
            } else {
                format!("spawn failed: {e}")
            };
            return CommandOutcome::spawn_failed(tag, start.elapsed().as_millis() as u64);
        }
    };

    if let (Some(data), Some(mut stdin)) = (stdin_data, child.stdin.take()) {
        let bytes = data.as_bytes().to_vec();
        tokio::spawn(async move {
            let _ = stdin.write_all(&bytes).await;
        });
    }

    let waited = if timeout_ms > 0 {
        tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            child.wait_with_output(),
        )
        .await
    } else {
        Ok(child.wait_with_output().await)
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    match waited {
        Ok(Ok(output)) => CommandOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            timed_out: false,
            spawn_error: None,
        },
        Ok(Err(e)) => CommandOutcome::spawn_failed(format!("wait failed: {e}"), duration_ms),
        Err(_elapsed) => {
            // kill_on_drop reaps the child once the future is dropped.
            CommandOutcome {
                exit_code: 124,
                stdout: String::new(),
                stderr: format!("killed after {timeout_ms} ms"),
                duration_ms,
                timed_out: true,
                spawn_error: None,
            }
        }
    }
}

/// Split a validated allowed-test command line into argv. Preflight rejects
/// shell metacharacters, so whitespace splitting is exact.
pub fn split_command_line(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
