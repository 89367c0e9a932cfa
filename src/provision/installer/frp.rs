use super::{
    Archive, Artifact, CpuArch, Layout, Release, Role, Side, TunnelBackend, ensure_token,
    require_ports, require_transport,
};
use crate::errors;
use crate::provision::types::{BackendKind, HostDescriptor, TunnelConfig};
use anyhow::{Context, Result};
use serde::Serialize;

pub const VERSION: &str = "0.61.0";

pub const TRANSPORTS: &[&str] = &["tcp", "kcp", "quic", "websocket"];

pub mod defaults {
    pub const TRANSPORT: &str = "tcp";
    pub const MAX_POOL_COUNT: i64 = 5;
    pub const POOL_COUNT: i64 = 1;
    pub const TCP_MUX: bool = true;
    pub const HEARTBEAT_TIMEOUT: i64 = 90;
    pub const HEARTBEAT_INTERVAL: i64 = 30;
}

#[derive(Debug, Serialize)]
struct Auth {
    method: &'static str,
    token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerTransport {
    max_pool_count: i64,
    tcp_mux: bool,
    heartbeat_timeout: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerFile {
    bind_addr: String,
    bind_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    kcp_bind_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quic_bind_port: Option<u16>,
    auth: Auth,
    transport: ServerTransport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientTransport {
    protocol: String,
    pool_count: i64,
    tcp_mux: bool,
    heartbeat_interval: i64,
    heartbeat_timeout: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Proxy {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "localIP")]
    local_ip: String,
    local_port: u16,
    remote_port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientFile {
    server_addr: String,
    server_port: u16,
    login_fail_exit: bool,
    auth: Auth,
    transport: ClientTransport,
    proxies: Vec<Proxy>,
}

pub struct Frp;

impl TunnelBackend for Frp {
    fn kind(&self) -> BackendKind {
        BackendKind::Frp
    }

    fn binary_name(&self, role: Role) -> &'static str {
        match role {
            Role::Server => "frps",
            Role::Client => "frpc",
        }
    }

    fn release(&self, arch: CpuArch, role: Role) -> Release {
        let dist = format!("frp_{}_linux_{}", VERSION, arch.go_name());
        Release {
            binary: self.binary_name(role).to_string(),
            url: format!(
                "https://github.com/fatedier/frp/releases/download/v{}/{}.tar.gz",
                VERSION, dist
            ),
            archive: Archive::TarGz {
                member: format!("{}/{}", dist, self.binary_name(role)),
            },
        }
    }

    fn prepare(&self, config: &mut TunnelConfig) -> Result<()> {
        require_transport(config, TRANSPORTS, defaults::TRANSPORT)?;
        require_ports(config)?;
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
        let heartbeat_timeout = config.int_or("heartbeat_timeout", defaults::HEARTBEAT_TIMEOUT)?;
        let tcp_mux = config.bool_or("tcp_mux", defaults::TCP_MUX)?;

        let server = ServerFile {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: config.listen_port,
            kcp_bind_port: (config.transport == "kcp").then_some(config.listen_port),
            quic_bind_port: (config.transport == "quic").then_some(config.listen_port),
            auth: Auth {
                method: "token",
                token: token.clone(),
            },
            transport: ServerTransport {
                max_pool_count: config.int_or("max_pool_count", defaults::MAX_POOL_COUNT)?,
                tcp_mux,
                heartbeat_timeout,
            },
        };

        let client = ClientFile {
            server_addr: host.address.clone(),
            server_port: config.listen_port,
            login_fail_exit: false,
            auth: Auth {
                method: "token",
                token,
            },
            transport: ClientTransport {
                protocol: config.transport.clone(),
                pool_count: config.int_or("pool_count", defaults::POOL_COUNT)?,
                tcp_mux,
                heartbeat_interval: config.int_or("heartbeat_interval", defaults::HEARTBEAT_INTERVAL)?,
                heartbeat_timeout,
            },
            proxies: require_ports(config)?
                .iter()
                .map(|rule| {
                    let target = rule.target_addr();
                    let local_ip = target
                        .rsplit_once(':')
                        .map(|(ip, _)| ip.to_string())
                        .unwrap_or_else(|| "127.0.0.1".to_string());
                    Proxy {
                        name: format!("{}-{}", config.display_name(), rule.listen),
                        kind: "tcp",
                        local_ip,
                        local_port: rule.target_port(),
                        remote_port: rule.listen,
                    }
                })
                .collect(),
        };

        Ok(vec![
            Artifact {
                side: Side::Remote,
                role: Role::Server,
                file_name: layout.artifact_name(Role::Server, "toml"),
                contents: toml::to_string(&server)
                    .context(errors::config::render_failed("frps"))?,
            },
            Artifact {
                side: Side::Local,
                role: Role::Client,
                file_name: layout.artifact_name(Role::Client, "toml"),
                contents: toml::to_string(&client)
                    .context(errors::config::render_failed("frpc"))?,
            },
        ])
    }

    fn exec_args(&self, _role: Role, config_path: &str) -> String {
        format!("-c {}", config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::installer::Installer;
    use crate::settings::Settings;

    #[test]
    fn test_renders_server_and_proxies() {
        let mut config = TunnelConfig::new(BackendKind::Frp, 7000, "kcp")
            .with_option("ports", "8080=80");
        config.token = Some("frp-token".to_string());
        let host = HostDescriptor::with_password("203.0.113.7", 22, "pw");

        let (_, artifacts) = Installer::new(BackendKind::Frp)
            .plan(&config, &host, &Settings::default())
            .unwrap();

        let server: toml::Value = toml::from_str(&artifacts[0].contents).unwrap();
        assert_eq!(server["bindPort"].as_integer(), Some(7000));
        assert_eq!(server["kcpBindPort"].as_integer(), Some(7000));
        assert_eq!(server["auth"]["token"].as_str(), Some("frp-token"));
        assert_eq!(server["transport"]["maxPoolCount"].as_integer(), Some(5));
        assert_eq!(server["transport"]["tcpMux"].as_bool(), Some(true));

        let client: toml::Value = toml::from_str(&artifacts[1].contents).unwrap();
        assert_eq!(client["serverAddr"].as_str(), Some("203.0.113.7"));
        assert_eq!(client["transport"]["protocol"].as_str(), Some("kcp"));
        let proxy = &client["proxies"][0];
        assert_eq!(proxy["localIP"].as_str(), Some("127.0.0.1"));
        assert_eq!(proxy["localPort"].as_integer(), Some(80));
        assert_eq!(proxy["remotePort"].as_integer(), Some(8080));
    }

    #[test]
    fn test_role_specific_binaries() {
        let server = Frp.release(CpuArch::Amd64, Role::Server);
        let client = Frp.release(CpuArch::Amd64, Role::Client);
        assert_eq!(server.binary, "frps");
        assert_eq!(client.binary, "frpc");
        assert_eq!(
            client.archive,
            Archive::TarGz {
                member: "frp_0.61.0_linux_amd64/frpc".to_string()
            }
        );
    }
}
