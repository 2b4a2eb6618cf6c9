//! Executor CLI adapters: codex (paid) and opencode-cli (free).

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use factory_core::collab::{ExecOutcome, ExecRequest, Executor};
use factory_core::domain::ExecutorKind;

use crate::command::run_command;

/// Runs executor CLIs as subprocesses, prompt on stdin.
pub struct ProcessExecutor {
    repo_root: PathBuf,
    codex_bin: String,
    occli_bin: String,
}

impl ProcessExecutor {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            codex_bin: std::env::var("CODEX_BIN").unwrap_or_else(|_| "codex".to_string()),
            occli_bin: std::env::var("OPENCODE_BIN").unwrap_or_else(|_| "opencode".to_string()),
        }
    }

    pub fn with_binaries(mut self, codex_bin: String, occli_bin: String) -> Self {
        self.codex_bin = codex_bin;
        self.occli_bin = occli_bin;
        self
    }

    fn argv(&self, request: &ExecRequest) -> Vec<String> {
        match request.executor {
            ExecutorKind::Codex => vec![
                self.codex_bin.clone(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "--model".to_string(),
                request.model.clone(),
            ],
            ExecutorKind::Opencodecli => vec![
                self.occli_bin.clone(),
                "run".to_string(),
                "--model".to_string(),
                request.model.clone(),
            ],
        }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn run(&self, request: &ExecRequest) -> ExecOutcome {
        let argv = self.argv(request);
        debug!(executor = request.executor.as_str(), model = %request.model, "invoking executor CLI");

        let outcome = run_command(
            &argv,
            &self.repo_root,
            request.timeout_ms,
            Some(&request.prompt),
        )
        .await;

        ExecOutcome {
            exit_code: if outcome.timed_out {
                Some(124)
            } else {
                Some(outcome.exit_code)
            },
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            timed_out: outcome.timed_out,
            error: outcome.spawn_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_executor_binary_surfaces_error() {
        let dir = tempdir().expect("tempdir");
        let executor = ProcessExecutor::new(dir.path()).with_binaries(
            "definitely-not-codex-xyz".to_string(),
            "definitely-not-opencode-xyz".to_string(),
        );

        let outcome = executor
            .run(&ExecRequest {
                executor: ExecutorKind::Codex,
                model: "gpt-5".to_string(),
                prompt: "noop".to_string(),
                timeout_ms: 1_000,
            })
            .await;
        assert!(outcome.error.expect("error").contains("missing_binary"));
    }

    #[tokio::test]
    async fn test_adapter_maps_clean_exit() {
        let dir = tempdir().expect("tempdir");
        // `true` ignores its args and stdin and exits 0.
        let executor = ProcessExecutor::new(dir.path())
            .with_binaries("true".to_string(), "true".to_string());

        let outcome = executor
            .run(&ExecRequest {
                executor: ExecutorKind::Opencodecli,
                model: "opencode/qwen3-coder".to_string(),
                prompt: "prompt body".to_string(),
                timeout_ms: 5_000,
            })
            .await;
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
        assert!(outcome.error.is_none());
    }
}
