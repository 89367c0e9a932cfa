pub mod backhaul;
pub mod frp;
pub mod gost;
pub mod hysteria;
pub mod rathole;
pub mod steps;

use crate::errors;
use crate::provision::records::RecordStore;
use crate::provision::types::{
    BackendKind, Checkpoint, HostDescriptor, PortRule, TunnelConfig, TunnelRecord,
};
use crate::provision::{LocalExecutor, RemoteExecutor};
use crate::settings::Settings;
use anyhow::{Context, Result, bail, ensure};
use itertools::Itertools;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Server on the remote host, client on the local one.
    DualHost,
    LocalOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Remote,
    Local,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Remote => write!(f, "remote"),
            Side::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    Amd64,
    Arm64,
}

impl CpuArch {
    pub fn from_uname(raw: &str) -> Result<Self> {
        match raw.trim() {
            "x86_64" | "amd64" => Ok(CpuArch::Amd64),
            "aarch64" | "arm64" | "armv8l" => Ok(CpuArch::Arm64),
            other => bail!(errors::install::unsupported_arch(other)),
        }
    }

    pub fn go_name(&self) -> &'static str {
        match self {
            CpuArch::Amd64 => "amd64",
            CpuArch::Arm64 => "arm64",
        }
    }

    pub fn rust_triple_prefix(&self) -> &'static str {
        match self {
            CpuArch::Amd64 => "x86_64",
            CpuArch::Arm64 => "aarch64",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Archive {
    TarGz { member: String },
    Zip { member: String },
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub binary: String,
    pub url: String,
    pub archive: Archive,
}

/// A generated configuration file destined for one side of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub side: Side,
    pub role: Role,
    pub file_name: String,
    pub contents: String,
}

/// Where things live on a provisioned host for one tunnel.
#[derive(Debug, Clone)]
pub struct Layout {
    backend: BackendKind,
    slug: String,
    install_dir: PathBuf,
    config_dir: PathBuf,
    unit_dir: PathBuf,
}

fn sanitize_name(name: &str) -> String {
    let slug = name
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c.to_ascii_lowercase(),
            '-' | '_' => c,
            _ => '-',
        })
        .collect::<String>();
    slug.split('-').filter(|s| !s.is_empty()).join("-")
}

impl Layout {
    pub fn new(settings: &Settings, config: &TunnelConfig) -> Self {
        let slug = sanitize_name(&config.display_name());
        Self {
            backend: config.backend,
            slug: if slug.is_empty() {
                config.listen_port.to_string()
            } else {
                slug
            },
            install_dir: settings.install_dir.clone(),
            config_dir: settings.config_dir.join(config.backend.as_str()),
            unit_dir: settings.unit_dir.clone(),
        }
    }

    fn render(path: &Path) -> String {
        path.display().to_string()
    }

    pub fn binary(&self, name: &str) -> String {
        Self::render(&self.install_dir.join(name))
    }

    pub fn config_dir(&self) -> String {
        Self::render(&self.config_dir)
    }

    pub fn config_file(&self, file_name: &str) -> String {
        Self::render(&self.config_dir.join(file_name))
    }

    pub fn artifact_name(&self, role: Role, extension: &str) -> String {
        format!("{}-{}.{}", role, self.slug, extension)
    }

    pub fn key_path(&self) -> String {
        self.config_file(&format!("{}.key", self.slug))
    }

    pub fn cert_path(&self) -> String {
        self.config_file(&format!("{}.crt", self.slug))
    }

    pub fn unit_name(&self, role: Role) -> String {
        format!("{}-{}-{}.service", self.backend, role, self.slug)
    }

    pub fn unit_path(&self, role: Role) -> String {
        Self::render(&self.unit_dir.join(self.unit_name(role)))
    }
}

/// Per-backend knowledge: release assets, mandatory fields, the native
/// configuration grammar and how the service invokes the binary.
pub trait TunnelBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn topology(&self) -> Topology {
        Topology::DualHost
    }

    fn binary_name(&self, role: Role) -> &'static str;

    fn release(&self, arch: CpuArch, role: Role) -> Release;

    /// Checks mandatory fields and fills in derived ones (generated tokens).
    fn prepare(&self, config: &mut TunnelConfig) -> Result<()>;

    fn needs_key_pair(&self, _config: &TunnelConfig) -> bool {
        false
    }

    fn render(
        &self,
        config: &TunnelConfig,
        host: &HostDescriptor,
        layout: &Layout,
    ) -> Result<Vec<Artifact>>;

    fn exec_args(&self, _role: Role, config_path: &str) -> String {
        config_path.to_string()
    }

    /// Ports to open on `side`; by default the listening side gets the
    /// tunnel port plus every forwarded port.
    fn firewall_ports(&self, config: &TunnelConfig, side: Side) -> Result<Vec<u16>> {
        let listening_side = match self.topology() {
            Topology::DualHost => Side::Remote,
            Topology::LocalOnly => Side::Local,
        };
        if side != listening_side {
            return Ok(Vec::new());
        }
        let mut ports = vec![config.listen_port];
        ports.extend(config.ports("ports")?.iter().map(|r| r.listen));
        Ok(ports.into_iter().unique().collect())
    }
}

impl BackendKind {
    pub fn backend(&self) -> &'static dyn TunnelBackend {
        match self {
            BackendKind::Backhaul => &backhaul::Backhaul,
            BackendKind::Rathole => &rathole::Rathole,
            BackendKind::Frp => &frp::Frp,
            BackendKind::Hysteria => &hysteria::Hysteria,
            BackendKind::Gost => &gost::Gost,
        }
    }
}

pub(crate) fn require_transport(config: &mut TunnelConfig, allowed: &[&str], default: &str) -> Result<()> {
    let transport = config.transport.trim().to_ascii_lowercase();
    config.transport = if transport.is_empty() {
        default.to_string()
    } else {
        transport
    };
    ensure!(
        allowed.contains(&config.transport.as_str()),
        errors::config::unsupported_transport(config.backend.as_str(), &config.transport, allowed)
    );
    Ok(())
}

pub(crate) fn require_ports(config: &TunnelConfig) -> Result<Vec<PortRule>> {
    let rules = config.ports("ports")?;
    ensure!(
        !rules.is_empty(),
        errors::config::ports_required(config.backend.as_str())
    );
    Ok(rules)
}

pub(crate) fn ensure_token(config: &mut TunnelConfig) {
    if config.token.as_deref().is_none_or(|t| t.trim().is_empty()) {
        config.token = Some(steps::generate_token(32));
        tracing::info!("Generated token for {} tunnel {}", config.backend, config.display_name());
    }
}

pub struct InstallContext {
    pub host: HostDescriptor,
    pub config: TunnelConfig,
    pub remote: Arc<dyn RemoteExecutor>,
    pub local: Arc<dyn LocalExecutor>,
    pub records: Arc<dyn RecordStore>,
    pub settings: Arc<Settings>,
}

impl InstallContext {
    pub async fn run_with_timeout(
        &self,
        side: Side,
        step: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String> {
        let output = match side {
            Side::Remote => self.remote.execute(&self.host, command, timeout).await,
            Side::Local => self.local.run(command, timeout).await,
        };
        output.into_result(step)
    }

    pub async fn run(&self, side: Side, step: &str, command: &str) -> Result<String> {
        self.run_with_timeout(side, step, command, self.settings.command_timeout)
            .await
    }

    /// Runs a check whose failure is an answer, not an error.
    pub async fn probe(&self, side: Side, command: &str) -> bool {
        let timeout = self.settings.command_timeout;
        match side {
            Side::Remote => self.remote.execute(&self.host, command, timeout).await.ok,
            Side::Local => self.local.run(command, timeout).await.ok,
        }
    }
}

/// Sending half of the checkpoint channel handed to an installer.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<Checkpoint>,
}

impl ProgressSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Checkpoint>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn report(&self, percentage: u8, message: impl Into<String>) {
        let checkpoint = Checkpoint::new(percentage, message);
        tracing::info!("[{:>3}%] {}", checkpoint.percentage, checkpoint.message);
        if self.tx.send(checkpoint).await.is_err() {
            tracing::debug!("Checkpoint receiver dropped");
        }
    }
}

struct Stage {
    start: u8,
    configured: u8,
    activated: u8,
}

const FIRST_HOST: Stage = Stage {
    start: 20,
    configured: 30,
    activated: 40,
};

const SECOND_HOST: Stage = Stage {
    start: 60,
    configured: 70,
    activated: 80,
};

/// Drives one backend through the install pipeline.
pub struct Installer {
    backend: &'static dyn TunnelBackend,
}

impl Installer {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            backend: kind.backend(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Validates `config` and renders every artifact without touching a host.
    pub fn plan(
        &self,
        config: &TunnelConfig,
        host: &HostDescriptor,
        settings: &Settings,
    ) -> Result<(TunnelConfig, Vec<Artifact>)> {
        ensure!(
            config.backend == self.backend.kind(),
            errors::config::backend_mismatch(config.backend.as_str(), self.backend.kind().as_str())
        );
        let mut config = config.clone();
        config.validate().context(errors::config::INVALID_TUNNEL)?;
        self.backend
            .prepare(&mut config)
            .context(errors::config::INVALID_TUNNEL)?;

        let layout = Layout::new(settings, &config);
        let artifacts = self.backend.render(&config, host, &layout)?;
        Ok((config, artifacts))
    }

    pub fn service_units(&self, config: &TunnelConfig, settings: &Settings, artifacts: &[Artifact]) -> Vec<(Side, String, String)> {
        let layout = Layout::new(settings, config);
        artifacts
            .iter()
            .map(|artifact| {
                let binary = layout.binary(self.backend.binary_name(artifact.role));
                let exec_start = format!(
                    "{} {}",
                    binary,
                    self.backend
                        .exec_args(artifact.role, &layout.config_file(&artifact.file_name))
                );
                let unit = steps::service_unit(
                    &format!("{} {} ({})", self.backend.kind(), artifact.role, config.display_name()),
                    &exec_start,
                    settings,
                );
                (artifact.side, layout.unit_path(artifact.role), unit)
            })
            .collect()
    }

    pub async fn install(&self, ctx: &InstallContext, progress: &ProgressSink) -> Result<TunnelRecord> {
        progress.report(5, "Validating configuration").await;
        let topology = self.backend.topology();
        if topology == Topology::DualHost {
            ctx.host.validate().context(errors::config::INVALID_HOST)?;
        }
        let (config, artifacts) = self.plan(&ctx.config, &ctx.host, &ctx.settings)?;
        let layout = Layout::new(&ctx.settings, &config);

        match topology {
            Topology::DualHost => {
                progress
                    .report(10, format!("Connecting to {}", ctx.host.address))
                    .await;
                ctx.run(
                    Side::Remote,
                    &errors::install::connect_step(&ctx.host.to_string()),
                    "echo connected",
                )
                .await?;

                self.provision_side(ctx, Side::Remote, &config, &artifacts, &layout, progress, &FIRST_HOST)
                    .await?;
                progress
                    .report(50, "Remote host configured, installing local side")
                    .await;
                self.provision_side(ctx, Side::Local, &config, &artifacts, &layout, progress, &SECOND_HOST)
                    .await?;
            }
            Topology::LocalOnly => {
                progress.report(10, "Preparing local host").await;
                self.provision_side(ctx, Side::Local, &config, &artifacts, &layout, progress, &FIRST_HOST)
                    .await?;
                progress.report(50, "Local relay configured").await;
            }
        }

        progress.report(90, "Saving tunnel record").await;
        let record = TunnelRecord::from_config(config);
        ctx.records
            .save(record.clone())
            .await
            .context(errors::install::PERSIST_FAILED)?;

        progress.report(100, "Done").await;
        Ok(record)
    }

    #[allow(clippy::too_many_arguments)]
    async fn provision_side(
        &self,
        ctx: &InstallContext,
        side: Side,
        config: &TunnelConfig,
        artifacts: &[Artifact],
        layout: &Layout,
        progress: &ProgressSink,
        stage: &Stage,
    ) -> Result<()> {
        let kind = self.backend.kind();
        let side_artifacts: Vec<&Artifact> = artifacts.iter().filter(|a| a.side == side).collect();
        if side_artifacts.is_empty() {
            return Ok(());
        }

        progress
            .report(stage.start, format!("Installing {} on {} host", kind, side))
            .await;
        let arch = steps::detect_arch(ctx, side).await?;
        let roles: Vec<Role> = side_artifacts.iter().map(|a| a.role).unique().collect();
        for role in roles {
            let release = self.backend.release(arch, role);
            steps::ensure_binary(ctx, side, &release, &layout.binary(&release.binary)).await?;
        }

        if side_artifacts.iter().any(|a| a.role == Role::Server) && self.backend.needs_key_pair(config) {
            steps::ensure_key_pair(ctx, side, layout, &config.display_name()).await?;
        }

        progress
            .report(stage.configured, format!("Writing {} configuration on {} host", kind, side))
            .await;
        for artifact in &side_artifacts {
            steps::write_file(
                ctx,
                side,
                &layout.config_file(&artifact.file_name),
                &artifact.contents,
                "600",
            )
            .await?;
        }

        let units = self.service_units(config, &ctx.settings, artifacts);
        for (_, unit_path, unit) in units.iter().filter(|(s, _, _)| *s == side) {
            steps::write_file(ctx, side, unit_path, unit, "644").await?;
        }

        let ports = self.backend.firewall_ports(config, side)?;
        if !ports.is_empty() {
            steps::open_firewall(ctx, side, &ports).await?;
        }

        for artifact in &side_artifacts {
            steps::activate(ctx, side, &layout.unit_name(artifact.role)).await?;
        }
        progress
            .report(stage.activated, format!("{} service active on {} host", kind, side))
            .await;
        Ok(())
    }
}
