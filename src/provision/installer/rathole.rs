use super::{
    Archive, Artifact, CpuArch, Layout, Release, Role, Side, TunnelBackend, ensure_token,
    require_ports, require_transport,
};
use crate::errors;
use crate::provision::types::{BackendKind, HostDescriptor, TunnelConfig};
use anyhow::{Context, Result, bail};
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;

pub const TRANSPORTS: &[&str] = &["tcp", "websocket"];

pub mod defaults {
    pub const TRANSPORT: &str = "tcp";
    pub const HEARTBEAT_INTERVAL: i64 = 30;
    pub const HEARTBEAT_TIMEOUT: i64 = 40;
    pub const RETRY_INTERVAL: i64 = 1;
    pub const NODELAY: bool = true;
    pub const KEEPALIVE_SECS: i64 = 20;
    pub const KEEPALIVE_INTERVAL: i64 = 8;
}

#[derive(Debug, Serialize)]
struct TcpOptions {
    nodelay: bool,
    keepalive_secs: i64,
    keepalive_interval: i64,
}

#[derive(Debug, Serialize)]
struct WebsocketOptions {
    tls: bool,
}

#[derive(Debug, Serialize)]
struct Transport {
    #[serde(rename = "type")]
    kind: String,
    tcp: TcpOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    websocket: Option<WebsocketOptions>,
}

#[derive(Debug, Serialize)]
struct ServerService {
    bind_addr: String,
}

#[derive(Debug, Serialize)]
struct ClientService {
    local_addr: String,
}

#[derive(Debug, Serialize)]
struct ServerSection {
    bind_addr: String,
    default_token: String,
    heartbeat_interval: i64,
    transport: Transport,
    services: BTreeMap<String, ServerService>,
}

#[derive(Debug, Serialize)]
struct ClientSection {
    remote_addr: String,
    default_token: String,
    heartbeat_timeout: i64,
    retry_interval: i64,
    transport: Transport,
    services: BTreeMap<String, ClientService>,
}

#[derive(Debug, Serialize)]
struct ServerFile {
    server: ServerSection,
}

#[derive(Debug, Serialize)]
struct ClientFile {
    client: ClientSection,
}

fn transport(config: &TunnelConfig) -> Result<Transport> {
    Ok(Transport {
        kind: config.transport.clone(),
        tcp: TcpOptions {
            nodelay: config.bool_or("nodelay", defaults::NODELAY)?,
            keepalive_secs: config.int_or("keepalive_secs", defaults::KEEPALIVE_SECS)?,
            keepalive_interval: config.int_or("keepalive_interval", defaults::KEEPALIVE_INTERVAL)?,
        },
        websocket: (config.transport == "websocket").then_some(WebsocketOptions { tls: false }),
    })
}

pub struct Rathole;

impl TunnelBackend for Rathole {
    fn kind(&self) -> BackendKind {
        BackendKind::Rathole
    }

    fn binary_name(&self, _role: Role) -> &'static str {
        "rathole"
    }

    fn release(&self, arch: CpuArch, role: Role) -> Release {
        Release {
            binary: self.binary_name(role).to_string(),
            url: format!(
                "https://github.com/rapiz1/rathole/releases/latest/download/rathole-{}-unknown-linux-gnu.zip",
                arch.rust_triple_prefix()
            ),
            archive: Archive::Zip {
                member: "rathole".to_string(),
            },
        }
    }

    fn prepare(&self, config: &mut TunnelConfig) -> Result<()> {
        require_transport(config, TRANSPORTS, defaults::TRANSPORT)?;
        // Services are keyed by listen port.
        if let Some(port) = require_ports(config)?.iter().map(|r| r.listen).duplicates().next() {
            bail!(errors::config::duplicate_listen_port(BackendKind::Rathole.as_str(), port));
        }
        ensure_token(config);
        Ok(())
    }

    fn render(
        &self,
        config: &TunnelConfig,
        host: &HostDescriptor,
        layout: &Layout,
    ) -> Result<Vec<Artifact>> {
        let token = config.token.clone().unwrap_or_default();
        let rules = require_ports(config)?;

        let server = ServerFile {
            server: ServerSection {
                bind_addr: format!("0.0.0.0:{}", config.listen_port),
                default_token: token.clone(),
                heartbeat_interval: config.int_or("heartbeat_interval", defaults::HEARTBEAT_INTERVAL)?,
                transport: transport(config)?,
                services: rules
                    .iter()
                    .map(|r| {
                        (
                            format!("p{}", r.listen),
                            ServerService {
                                bind_addr: format!("0.0.0.0:{}", r.listen),
                            },
                        )
                    })
                    .collect(),
            },
        };
        let client = ClientFile {
            client: ClientSection {
                remote_addr: format!("{}:{}", host.address, config.listen_port),
                default_token: token,
                heartbeat_timeout: config.int_or("heartbeat_timeout", defaults::HEARTBEAT_TIMEOUT)?,
                retry_interval: config.int_or("retry_interval", defaults::RETRY_INTERVAL)?,
                transport: transport(config)?,
                services: rules
                    .iter()
                    .map(|r| {
                        (
                            format!("p{}", r.listen),
                            ClientService {
                                local_addr: r.target_addr(),
                            },
                        )
                    })
                    .collect(),
            },
        };

        Ok(vec![
            Artifact {
                side: Side::Remote,
                role: Role::Server,
                file_name: layout.artifact_name(Role::Server, "toml"),
                contents: toml::to_string(&server)
                    .context(errors::config::render_failed("rathole server"))?,
            },
            Artifact {
                side: Side::Local,
                role: Role::Client,
                file_name: layout.artifact_name(Role::Client, "toml"),
                contents: toml::to_string(&client)
                    .context(errors::config::render_failed("rathole client"))?,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::installer::Installer;
    use crate::settings::Settings;

    #[test]
    fn test_duplicate_listen_ports_rejected() {
        let config = TunnelConfig::new(BackendKind::Rathole, 2333, "")
            .with_option("ports", "8080=80, 9000=90, 8080=10.0.0.5:8080");
        let host = HostDescriptor::with_password("203.0.113.7", 22, "pw");
        let err = Installer::new(BackendKind::Rathole)
            .plan(&config, &host, &Settings::default())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("listen port 8080 twice"));
    }

    #[test]
    fn test_services_per_port_rule() {
        let config = TunnelConfig::new(BackendKind::Rathole, 2333, "")
            .with_option("ports", "8080=80, 2222=10.0.0.5:22");
        let host = HostDescriptor::with_password("203.0.113.7", 22, "pw");
        let (prepared, artifacts) = Installer::new(BackendKind::Rathole)
            .plan(&config, &host, &Settings::default())
            .unwrap();

        let server: toml::Value = toml::from_str(&artifacts[0].contents).unwrap();
        assert_eq!(server["server"]["bind_addr"].as_str(), Some("0.0.0.0:2333"));
        assert_eq!(server["server"]["heartbeat_interval"].as_integer(), Some(30));
        assert_eq!(server["server"]["transport"]["type"].as_str(), Some("tcp"));
        assert_eq!(
            server["server"]["services"]["p8080"]["bind_addr"].as_str(),
            Some("0.0.0.0:8080")
        );
        assert_eq!(
            server["server"]["default_token"].as_str(),
            prepared.token.as_deref()
        );

        let client: toml::Value = toml::from_str(&artifacts[1].contents).unwrap();
        assert_eq!(client["client"]["remote_addr"].as_str(), Some("203.0.113.7:2333"));
        assert_eq!(client["client"]["retry_interval"].as_integer(), Some(1));
        assert_eq!(
            client["client"]["services"]["p2222"]["local_addr"].as_str(),
            Some("10.0.0.5:22")
        );
        assert_eq!(
            client["client"]["services"]["p8080"]["local_addr"].as_str(),
            Some("127.0.0.1:80")
        );
    }

    #[test]
    fn test_requires_port_rules() {
        let config = TunnelConfig::new(BackendKind::Rathole, 2333, "tcp");
        let host = HostDescriptor::with_password("203.0.113.7", 22, "pw");
        let err = Installer::new(BackendKind::Rathole)
            .plan(&config, &host, &Settings::default())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("port rule"));
    }
}
