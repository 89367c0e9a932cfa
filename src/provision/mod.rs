pub mod engine;
pub mod installer;
pub mod local;
pub mod mock_executor;
pub mod progress;
pub mod records;
pub mod remote;
pub mod types;

use async_trait::async_trait;
use std::time::Duration;
use types::HostDescriptor;

use crate::errors;

/// Outcome of one shell command. Unreachable hosts, rejected credentials and
/// non-zero exits all land here as `ok == false` with the reason in `output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub ok: bool,
    pub output: String,
}

impl ExecOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: output.into(),
        }
    }

    pub fn from_process(output: std::process::Output) -> Self {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        if output.status.success() {
            Self::success(combined)
        } else {
            let status = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            if combined.trim().is_empty() {
                Self::failure(errors::exec::exited_silently(&status))
            } else {
                Self::failure(combined)
            }
        }
    }

    /// Turns a failed call into an error naming `step`, keeping the raw output.
    pub fn into_result(self, step: &str) -> anyhow::Result<String> {
        if self.ok {
            Ok(self.output)
        } else {
            anyhow::bail!(errors::install::step_failed(step, self.output.trim()))
        }
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, host: &HostDescriptor, command: &str, timeout: Duration) -> ExecOutput;
}

#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> ExecOutput;
}

pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_into_result_names_step() {
        let err = ExecOutput::failure("curl: (6) Could not resolve host")
            .into_result("Downloading backhaul")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Downloading backhaul"));
        assert!(message.contains("Could not resolve host"));
    }

    #[cfg(unix)]
    #[test]
    fn test_from_process_non_zero_is_failure_even_without_stderr() {
        use std::os::unix::process::ExitStatusExt;

        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(1 << 8),
            stdout: b"partial".to_vec(),
            stderr: Vec::new(),
        };
        let result = ExecOutput::from_process(output);
        assert!(!result.ok);
        assert_eq!(result.output, "partial");
    }

    #[cfg(unix)]
    #[test]
    fn test_from_process_concatenates_streams() {
        use std::os::unix::process::ExitStatusExt;

        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: b"out".to_vec(),
            stderr: b"warning: deprecated".to_vec(),
        };
        let result = ExecOutput::from_process(output);
        assert!(result.ok);
        assert_eq!(result.output, "out\nwarning: deprecated");
    }
}
