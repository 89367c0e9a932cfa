use anyhow::{Context, bail, ensure};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The closed set of tunnel backends this crate knows how to install.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::EnumString,
    strum::Display,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendKind {
    Backhaul,
    Rathole,
    Frp,
    Hysteria,
    Gost,
}

impl BackendKind {
    pub fn all() -> impl Iterator<Item = Self> {
        use strum::IntoEnumIterator;
        Self::iter()
    }

    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAuth {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub username: String,
    pub auth: HostAuth,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

impl HostDescriptor {
    pub fn with_password(address: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            username: default_ssh_user(),
            auth: HostAuth {
                password: Some(password.into()),
                private_key: None,
            },
        }
    }

    pub fn is_root(&self) -> bool {
        self.username == "root"
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.address.trim().is_empty(), errors::host::ADDRESS_EMPTY);
        ensure!(self.port != 0, errors::host::PORT_ZERO);
        ensure!(!self.username.trim().is_empty(), errors::host::USER_EMPTY);
        ensure!(
            self.auth.password.is_some() || self.auth.private_key.is_some(),
            errors::host::NO_CREDENTIALS
        );
        Ok(())
    }
}

impl fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.address, self.port)
    }
}

/// `listen[=target]`, where target is a port or `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRule {
    pub listen: u16,
    pub target: Option<String>,
}

impl PortRule {
    pub fn new(listen: u16) -> Self {
        Self {
            listen,
            target: None,
        }
    }

    /// Where the forwarded traffic lands, defaulting to the same port on loopback.
    pub fn target_addr(&self) -> String {
        match &self.target {
            None => format!("127.0.0.1:{}", self.listen),
            Some(t) if t.contains(':') => t.clone(),
            Some(port) => format!("127.0.0.1:{}", port),
        }
    }

    pub fn target_port(&self) -> u16 {
        self.target
            .as_deref()
            .and_then(|t| t.rsplit(':').next())
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.listen)
    }
}

fn parse_port(raw: &str) -> anyhow::Result<u16> {
    let port: u16 = raw
        .trim()
        .parse()
        .with_context(|| errors::config::invalid_port(raw))?;
    ensure!(port != 0, errors::config::invalid_port(raw));
    Ok(port)
}

impl FromStr for PortRule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (listen, target) = match s.split_once('=') {
            Some((l, t)) => (l, Some(t.trim())),
            None => (s, None),
        };
        let listen = parse_port(listen)?;
        let target = match target {
            None => None,
            Some(t) => match t.rsplit_once(':') {
                Some((host, port)) => {
                    ensure!(!host.is_empty(), errors::config::invalid_port_rule(s));
                    parse_port(port)?;
                    Some(t.to_string())
                }
                None => Some(parse_port(t)?.to_string()),
            },
        };
        Ok(Self { listen, target })
    }
}

impl fmt::Display for PortRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(t) => write!(f, "{}={}", self.listen, t),
            None => write!(f, "{}", self.listen),
        }
    }
}

impl Serialize for PortRule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortRule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Port(u16),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Port(p) => Ok(PortRule::new(p)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Integer(i64),
    Text(String),
    Ports(Vec<PortRule>),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Integer(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Integer(v.into())
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<Vec<PortRule>> for OptionValue {
    fn from(v: Vec<PortRule>) -> Self {
        OptionValue::Ports(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub backend: BackendKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub transport: String,
    pub listen_port: u16,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
}

impl TunnelConfig {
    pub fn new(backend: BackendKind, listen_port: u16, transport: impl Into<String>) -> Self {
        Self {
            backend,
            name: String::new(),
            transport: transport.into(),
            listen_port,
            token: None,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("{}-{}", self.backend, self.listen_port)
        } else {
            self.name.clone()
        }
    }

    pub fn int_or(&self, key: &str, default: i64) -> anyhow::Result<i64> {
        match self.options.get(key) {
            None => Ok(default),
            Some(OptionValue::Integer(v)) => Ok(*v),
            Some(OptionValue::Text(s)) => s
                .trim()
                .parse()
                .with_context(|| errors::config::not_an_integer(key, s)),
            Some(other) => bail!(errors::config::wrong_type(key, "an integer", other)),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> anyhow::Result<bool> {
        match self.options.get(key) {
            None => Ok(default),
            Some(OptionValue::Bool(v)) => Ok(*v),
            Some(OptionValue::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => bail!(errors::config::wrong_type(key, "a boolean", &OptionValue::Text(s.clone()))),
            },
            Some(other) => bail!(errors::config::wrong_type(key, "a boolean", other)),
        }
    }

    pub fn text(&self, key: &str) -> anyhow::Result<Option<String>> {
        match self.options.get(key) {
            None => Ok(None),
            Some(OptionValue::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(OptionValue::Text(s)) => Ok(Some(s.trim().to_string())),
            Some(OptionValue::Integer(v)) => Ok(Some(v.to_string())),
            Some(other) => bail!(errors::config::wrong_type(key, "a string", other)),
        }
    }

    pub fn text_or(&self, key: &str, default: &str) -> anyhow::Result<String> {
        Ok(self.text(key)?.unwrap_or_else(|| default.to_string()))
    }

    /// Port rules under `key`; a comma separated string is accepted as well.
    pub fn ports(&self, key: &str) -> anyhow::Result<Vec<PortRule>> {
        match self.options.get(key) {
            None => Ok(Vec::new()),
            Some(OptionValue::Ports(rules)) => Ok(rules.clone()),
            Some(OptionValue::Integer(p)) => {
                let port = u16::try_from(*p).with_context(|| errors::config::invalid_port(&p.to_string()))?;
                Ok(vec![PortRule::new(port)])
            }
            Some(OptionValue::Text(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::parse)
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| errors::config::invalid_option(key)),
            Some(other) => bail!(errors::config::wrong_type(key, "a list of port rules", other)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.listen_port != 0, errors::config::invalid_port("0"));
        ensure!(
            self.name.len() <= 100,
            errors::config::name_too_long(self.name.len())
        );
        if let Some(token) = &self.token {
            ensure!(
                !token.chars().any(|c| c.is_whitespace() || c == '"' || c == '\''),
                errors::config::TOKEN_CHARSET
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: RecordId,
    pub name: String,
    pub backend: BackendKind,
    pub listen_port: u16,
    pub token: Option<String>,
    pub config: TunnelConfig,
    pub status: RecordStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl TunnelRecord {
    pub fn from_config(config: TunnelConfig) -> Self {
        Self {
            id: RecordId::new(),
            name: config.display_name(),
            backend: config.backend,
            listen_port: config.listen_port,
            token: config.token.clone(),
            config,
            status: RecordStatus::Active,
            created_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub percentage: u8,
    pub status: TaskStatus,
    pub message: String,
}

impl TaskSnapshot {
    pub fn waiting() -> Self {
        Self {
            percentage: 0,
            status: TaskStatus::Queued,
            message: "waiting".to_string(),
        }
    }

    pub fn running(percentage: u8, message: impl Into<String>) -> Self {
        Self {
            percentage,
            status: TaskStatus::Running,
            message: message.into(),
        }
    }

    pub fn completed() -> Self {
        Self {
            percentage: 100,
            status: TaskStatus::Completed,
            message: "Installation Successfully Completed!".to_string(),
        }
    }

    pub fn failed(percentage: u8, cause: impl fmt::Display) -> Self {
        Self {
            percentage,
            status: TaskStatus::Error,
            message: format!("Error: {}", cause),
        }
    }

    /// Applies `next` on top of `self`, or `None` when the transition is not allowed.
    pub fn advance(&self, next: TaskSnapshot) -> Option<TaskSnapshot> {
        if self.status.is_terminal() {
            return None;
        }

        let mut next = next;
        next.percentage = next.percentage.min(100);
        match next.status {
            TaskStatus::Completed => next.percentage = 100,
            TaskStatus::Queued if self.status == TaskStatus::Running => return None,
            _ => next.percentage = next.percentage.max(self.percentage),
        }
        Some(next)
    }
}

impl Default for TaskSnapshot {
    fn default() -> Self {
        Self::waiting()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub percentage: u8,
    pub message: String,
}

impl Checkpoint {
    pub fn new(percentage: u8, message: impl Into<String>) -> Self {
        Self {
            percentage,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_rule_parse_forms() {
        let plain: PortRule = "443".parse().unwrap();
        assert_eq!(plain, PortRule::new(443));
        assert_eq!(plain.target_addr(), "127.0.0.1:443");

        let remapped: PortRule = "8080=80".parse().unwrap();
        assert_eq!(remapped.target_addr(), "127.0.0.1:80");
        assert_eq!(remapped.target_port(), 80);

        let remote: PortRule = "2222=10.1.1.5:22".parse().unwrap();
        assert_eq!(remote.target_addr(), "10.1.1.5:22");
        assert_eq!(remote.to_string(), "2222=10.1.1.5:22");
    }

    #[test]
    fn test_port_rule_rejects_non_numeric() {
        let result = "http".parse::<PortRule>();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid port"));
        assert!("80=:90".parse::<PortRule>().is_err());
        assert!("0".parse::<PortRule>().is_err());
    }

    #[test]
    fn test_config_option_accessors() {
        let config = TunnelConfig::new(BackendKind::Backhaul, 443, "tcp")
            .with_option("channel_size", 4096)
            .with_option("nodelay", "false")
            .with_option("ports", "80, 8443=443");

        assert_eq!(config.int_or("channel_size", 2048).unwrap(), 4096);
        assert_eq!(config.int_or("heartbeat", 40).unwrap(), 40);
        assert!(!config.bool_or("nodelay", true).unwrap());
        assert_eq!(config.ports("ports").unwrap().len(), 2);
    }

    #[test]
    fn test_config_option_wrong_type() {
        let config = TunnelConfig::new(BackendKind::Backhaul, 443, "tcp")
            .with_option("channel_size", "large");

        let result = config.int_or("channel_size", 2048);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("channel_size"));
    }

    #[test]
    fn test_config_yaml_round_trip_keeps_options() {
        let yaml = r#"
backend: backhaul
name: edge
transport: tcp
listen_port: 443
options:
  nodelay: true
  channel_size: 2048
  ports: ["80", "8080=80"]
"#;
        let config: TunnelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.backend, BackendKind::Backhaul);
        assert_eq!(config.options.get("nodelay"), Some(&OptionValue::Bool(true)));
        assert_eq!(config.ports("ports").unwrap()[1].target_port(), 80);
    }

    #[test]
    fn test_backend_kind_parse_case_insensitive() {
        assert_eq!("Backhaul".parse::<BackendKind>().unwrap(), BackendKind::Backhaul);
        assert_eq!(BackendKind::Hysteria.as_str(), "hysteria");
        assert_eq!(BackendKind::all().count(), 5);
        assert!("wireguard".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_snapshot_terminal_is_sticky() {
        let done = TaskSnapshot::completed();
        assert!(done.advance(TaskSnapshot::running(50, "again")).is_none());

        let failed = TaskSnapshot::failed(30, "boom");
        assert!(failed.advance(TaskSnapshot::completed()).is_none());
    }

    #[test]
    fn test_snapshot_percentage_monotone() {
        let current = TaskSnapshot::running(60, "local");
        let next = current.advance(TaskSnapshot::running(40, "late")).unwrap();
        assert_eq!(next.percentage, 60);
        assert_eq!(next.message, "late");

        let failed = current.advance(TaskSnapshot::failed(0, "x")).unwrap();
        assert_eq!(failed.percentage, 60);
        assert_eq!(failed.status, TaskStatus::Error);
    }

    #[test]
    fn test_snapshot_completed_forces_hundred() {
        let current = TaskSnapshot::running(10, "connecting");
        let mut done = TaskSnapshot::completed();
        done.percentage = 42;
        assert_eq!(current.advance(done).unwrap().percentage, 100);
    }

    #[test]
    fn test_host_validate_requires_credentials() {
        let mut host = HostDescriptor::with_password("10.0.0.1", 22, "secret");
        assert!(host.validate().is_ok());

        host.auth.password = None;
        let result = host.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("credentials"));
    }
}
