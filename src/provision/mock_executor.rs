use crate::provision::types::HostDescriptor;
use crate::provision::{ExecOutput, LocalExecutor, RemoteExecutor};
use async_trait::async_trait;
use base64::Engine;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockTarget {
    Remote,
    Local,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// `None` for commands run on the local host.
    pub host: Option<String>,
    pub command: String,
}

#[derive(Debug, Clone)]
struct MockRule {
    target: MockTarget,
    contains: String,
    output: ExecOutput,
}

/// Records every command and answers from scripted rules. Nothing is
/// present on either host unless a rule says so; everything else succeeds.
pub struct MockExecutor {
    calls: Mutex<Vec<MockCall>>,
    rules: Vec<MockRule>,
    remote_reachable: bool,
    latency: Duration,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            rules: Vec::new(),
            remote_reachable: true,
            latency: Duration::ZERO,
        }
    }

    pub fn respond(mut self, target: MockTarget, contains: &str, output: ExecOutput) -> Self {
        self.rules.push(MockRule {
            target,
            contains: contains.to_string(),
            output,
        });
        self
    }

    pub fn with_binary_present(self, target: MockTarget, binary: &str) -> Self {
        self.respond(target, &format!("test -x '{}'", binary), ExecOutput::success(""))
    }

    pub fn unreachable_remote(mut self) -> Self {
        self.remote_reachable = false;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn remote_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.host.is_some())
            .map(|c| c.command)
            .collect()
    }

    pub fn local_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.host.is_none())
            .map(|c| c.command)
            .collect()
    }

    /// Decodes the last file written to `path` on the given side.
    pub fn written_file(&self, target: MockTarget, path: &str) -> Option<String> {
        let marker = format!("| base64 -d > '{}'", path);
        self.calls()
            .into_iter()
            .filter(|c| match target {
                MockTarget::Remote => c.host.is_some(),
                MockTarget::Local => c.host.is_none(),
                MockTarget::Any => true,
            })
            .filter(|c| c.command.contains(&marker))
            .filter_map(|c| {
                let start = c.command.find("printf '%s' '")? + "printf '%s' '".len();
                let end = start + c.command[start..].find('\'')?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&c.command[start..end])
                    .ok()?;
                String::from_utf8(bytes).ok()
            })
            .next_back()
    }

    fn answer(&self, host: Option<&HostDescriptor>, command: &str) -> ExecOutput {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                host: host.map(|h| h.address.clone()),
                command: command.to_string(),
            });
        }

        if let Some(host) = host
            && !self.remote_reachable
        {
            return ExecOutput::failure(format!(
                "ssh: connect to host {} port {}: Connection refused",
                host.address, host.port
            ));
        }

        let target_matches = |rule: &MockRule| match rule.target {
            MockTarget::Any => true,
            MockTarget::Remote => host.is_some(),
            MockTarget::Local => host.is_none(),
        };
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| target_matches(r) && command.contains(&r.contains))
        {
            return rule.output.clone();
        }

        if command.starts_with("test -x") || command.starts_with("test -f") {
            ExecOutput::failure("")
        } else if command == "uname -m" {
            ExecOutput::success("x86_64\n")
        } else {
            ExecOutput::success("")
        }
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn execute(&self, host: &HostDescriptor, command: &str, _timeout: Duration) -> ExecOutput {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        tracing::info!("MOCK: ssh {}: {}", host, command);
        self.answer(Some(host), command)
    }
}

#[async_trait]
impl LocalExecutor for MockExecutor {
    async fn run(&self, command: &str, _timeout: Duration) -> ExecOutput {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        tracing::info!("MOCK: local: {}", command);
        self.answer(None, command)
    }
}
