use crate::errors;
use crate::provision::{ExecOutput, LocalExecutor};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Runs commands on the managed host itself through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct LocalShell;

impl LocalShell {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LocalExecutor for LocalShell {
    async fn run(&self, command: &str, timeout: Duration) -> ExecOutput {
        tracing::debug!("local: {}", command);

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to spawn local shell: {}", e);
                return ExecOutput::failure(errors::exec::local_spawn_failed(&e.to_string()));
            }
        };

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ExecOutput::from_process(output),
            Ok(Err(e)) => ExecOutput::failure(errors::exec::local_wait_failed(&e.to_string())),
            Err(_) => ExecOutput::failure(errors::exec::local_timed_out(timeout)),
        };

        if !output.ok {
            tracing::warn!("Local command failed: {}", output.output.trim());
        }
        output
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_and_captures_both_streams() {
        let output = LocalShell::new()
            .run("echo out; echo err 1>&2", Duration::from_secs(5))
            .await;
        assert!(output.ok);
        assert!(output.output.contains("out"));
        assert!(output.output.contains("err"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let output = LocalShell::new()
            .run("echo almost; exit 3", Duration::from_secs(5))
            .await;
        assert!(!output.ok);
        assert!(output.output.contains("almost"));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let output = LocalShell::new()
            .run("sleep 5", Duration::from_millis(100))
            .await;
        assert!(!output.ok);
        assert!(output.output.contains("timed out"));
    }
}
