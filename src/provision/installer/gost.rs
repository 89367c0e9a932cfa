use super::{
    Archive, Artifact, CpuArch, Layout, Release, Role, Side, Topology, TunnelBackend,
    require_transport,
};
use crate::errors;
use crate::provision::types::{BackendKind, HostDescriptor, PortRule, TunnelConfig};
use anyhow::{Context, Result, ensure};
use itertools::Itertools;
use serde::Serialize;

pub const VERSION: &str = "3.0.0";

pub const TRANSPORTS: &[&str] = &["tcp", "udp"];

pub mod defaults {
    pub const TRANSPORT: &str = "tcp";
}

#[derive(Debug, Serialize)]
struct Kind {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct Node {
    name: String,
    addr: String,
}

#[derive(Debug, Serialize)]
struct Forwarder {
    nodes: Vec<Node>,
}

#[derive(Debug, Serialize)]
struct Service {
    name: String,
    addr: String,
    handler: Kind,
    listener: Kind,
    forwarder: Forwarder,
}

#[derive(Debug, Serialize)]
struct RelayFile {
    services: Vec<Service>,
}

/// Forwarded ports; without explicit rules the tunnel port itself is relayed.
fn relayed(config: &TunnelConfig) -> Result<Vec<PortRule>> {
    let rules = config.ports("ports")?;
    Ok(if rules.is_empty() {
        vec![PortRule::new(config.listen_port)]
    } else {
        rules
    })
}

fn remote_address(config: &TunnelConfig) -> Result<String> {
    config
        .text("remote_address")?
        .ok_or_else(|| {
            anyhow::anyhow!(errors::config::missing_option(
                config.backend.as_str(),
                "remote_address"
            ))
        })
}

pub struct Gost;

impl TunnelBackend for Gost {
    fn kind(&self) -> BackendKind {
        BackendKind::Gost
    }

    fn topology(&self) -> Topology {
        Topology::LocalOnly
    }

    fn binary_name(&self, _role: Role) -> &'static str {
        "gost"
    }

    fn release(&self, arch: CpuArch, role: Role) -> Release {
        Release {
            binary: self.binary_name(role).to_string(),
            url: format!(
                "https://github.com/go-gost/gost/releases/download/v{v}/gost_{v}_linux_{arch}.tar.gz",
                v = VERSION,
                arch = arch.go_name()
            ),
            archive: Archive::TarGz {
                member: "gost".to_string(),
            },
        }
    }

    fn prepare(&self, config: &mut TunnelConfig) -> Result<()> {
        require_transport(config, TRANSPORTS, defaults::TRANSPORT)?;
        let remote = remote_address(config)?;
        ensure!(
            !remote.contains(char::is_whitespace),
            errors::config::invalid_option("remote_address")
        );
        relayed(config)?;
        Ok(())
    }

    fn render(
        &self,
        config: &TunnelConfig,
        _host: &HostDescriptor,
        layout: &Layout,
    ) -> Result<Vec<Artifact>> {
        let remote = remote_address(config)?;
        let relay = RelayFile {
            services: relayed(config)?
                .iter()
                .map(|rule| Service {
                    name: format!("{}-{}", config.transport, rule.listen),
                    addr: format!(":{}", rule.listen),
                    handler: Kind {
                        kind: config.transport.clone(),
                    },
                    listener: Kind {
                        kind: config.transport.clone(),
                    },
                    forwarder: Forwarder {
                        nodes: vec![Node {
                            name: format!("target-{}", rule.listen),
                            addr: format!("{}:{}", remote, rule.target_port()),
                        }],
                    },
                })
                .collect(),
        };

        Ok(vec![Artifact {
            side: Side::Local,
            role: Role::Server,
            file_name: layout.artifact_name(Role::Server, "yaml"),
            contents: serde_yaml::to_string(&relay)
                .context(errors::config::render_failed("gost relay"))?,
        }])
    }

    fn exec_args(&self, _role: Role, config_path: &str) -> String {
        format!("-C {}", config_path)
    }

    fn firewall_ports(&self, config: &TunnelConfig, side: Side) -> Result<Vec<u16>> {
        if side != Side::Local {
            return Ok(Vec::new());
        }
        Ok(relayed(config)?.iter().map(|r| r.listen).unique().collect())
    }
}
