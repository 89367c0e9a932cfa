//! Backhaul: TOML configuration, server on the remote host and client on
//! the local one. The `wss`/`wssmux` transports terminate TLS on the
//! server with a self-signed key pair.

use super::{
    Archive, Artifact, CpuArch, Layout, Release, Role, Side, TunnelBackend, ensure_token,
    require_transport,
};
use crate::errors;
use crate::provision::types::{BackendKind, HostDescriptor, TunnelConfig};
use anyhow::{Context, Result, ensure};
use serde::Serialize;

pub const TRANSPORTS: &[&str] = &["tcp", "tcpmux", "udp", "ws", "wss", "wsmux", "wssmux"];

pub mod defaults {
    pub const TRANSPORT: &str = "tcp";
    pub const KEEPALIVE_PERIOD: i64 = 75;
    pub const NODELAY: bool = true;
    pub const HEARTBEAT: i64 = 40;
    pub const CHANNEL_SIZE: i64 = 2048;
    pub const ACCEPT_UDP: bool = false;
    pub const SNIFFER: bool = false;
    pub const WEB_PORT: i64 = 0;
    pub const LOG_LEVEL: &str = "info";

    pub const MUX_CON: i64 = 8;
    pub const MUX_VERSION: i64 = 1;
    pub const MUX_FRAMESIZE: i64 = 32_768;
    pub const MUX_RECEIVEBUFFER: i64 = 4_194_304;
    pub const MUX_STREAMBUFFER: i64 = 65_536;

    pub const CONNECTION_POOL: i64 = 8;
    pub const AGGRESSIVE_POOL: bool = false;
    pub const DIAL_TIMEOUT: i64 = 10;
    pub const RETRY_INTERVAL: i64 = 3;
}

#[derive(Debug, Serialize)]
struct MuxSettings {
    mux_version: i64,
    mux_framesize: i64,
    // Backhaul spells it this way.
    mux_recievebuffer: i64,
    mux_streambuffer: i64,
}

#[derive(Debug, Serialize)]
struct ServerSection {
    bind_addr: String,
    transport: String,
    accept_udp: bool,
    token: String,
    keepalive_period: i64,
    nodelay: bool,
    heartbeat: i64,
    channel_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    mux_con: Option<i64>,
    #[serde(flatten)]
    mux: Option<MuxSettings>,
    sniffer: bool,
    web_port: i64,
    log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_key: Option<String>,
    ports: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ClientSection {
    remote_addr: String,
    transport: String,
    token: String,
    connection_pool: i64,
    aggressive_pool: bool,
    keepalive_period: i64,
    dial_timeout: i64,
    retry_interval: i64,
    nodelay: bool,
    #[serde(flatten)]
    mux: Option<MuxSettings>,
    sniffer: bool,
    web_port: i64,
    log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    edge_ip: Option<String>,
}

#[derive(Debug, Serialize)]
struct ServerFile {
    server: ServerSection,
}

#[derive(Debug, Serialize)]
struct ClientFile {
    client: ClientSection,
}

fn is_mux(transport: &str) -> bool {
    transport.ends_with("mux")
}

fn mux_settings(config: &TunnelConfig) -> Result<Option<MuxSettings>> {
    if !is_mux(&config.transport) {
        return Ok(None);
    }
    Ok(Some(MuxSettings {
        mux_version: config.int_or("mux_version", defaults::MUX_VERSION)?,
        mux_framesize: config.int_or("mux_framesize", defaults::MUX_FRAMESIZE)?,
        mux_recievebuffer: config.int_or("mux_receivebuffer", defaults::MUX_RECEIVEBUFFER)?,
        mux_streambuffer: config.int_or("mux_streambuffer", defaults::MUX_STREAMBUFFER)?,
    }))
}

fn positive(config: &TunnelConfig, key: &str, default: i64) -> Result<i64> {
    let value = config.int_or(key, default)?;
    ensure!(value > 0, errors::config::must_be_positive(key, value));
    Ok(value)
}

pub struct Backhaul;

impl Backhaul {
    fn server_file(&self, config: &TunnelConfig, layout: &Layout) -> Result<ServerFile> {
        let tls = self.needs_key_pair(config);
        let web_port = config.int_or("web_port", defaults::WEB_PORT)?;
        ensure!(
            (0..=65535).contains(&web_port),
            errors::config::invalid_port(&web_port.to_string())
        );

        Ok(ServerFile {
            server: ServerSection {
                bind_addr: format!("0.0.0.0:{}", config.listen_port),
                transport: config.transport.clone(),
                accept_udp: config.bool_or("accept_udp", defaults::ACCEPT_UDP)?,
                token: config.token.clone().unwrap_or_default(),
                keepalive_period: positive(config, "keepalive_period", defaults::KEEPALIVE_PERIOD)?,
                nodelay: config.bool_or("nodelay", defaults::NODELAY)?,
                heartbeat: positive(config, "heartbeat", defaults::HEARTBEAT)?,
                channel_size: positive(config, "channel_size", defaults::CHANNEL_SIZE)?,
                mux_con: if is_mux(&config.transport) {
                    Some(positive(config, "mux_con", defaults::MUX_CON)?)
                } else {
                    None
                },
                mux: mux_settings(config)?,
                sniffer: config.bool_or("sniffer", defaults::SNIFFER)?,
                web_port,
                log_level: config.text_or("log_level", defaults::LOG_LEVEL)?,
                tls_cert: tls.then(|| layout.cert_path()),
                tls_key: tls.then(|| layout.key_path()),
                ports: config
                    .ports("ports")?
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            },
        })
    }

    fn client_file(&self, config: &TunnelConfig, host: &HostDescriptor) -> Result<ClientFile> {
        Ok(ClientFile {
            client: ClientSection {
                remote_addr: format!("{}:{}", host.address, config.listen_port),
                transport: config.transport.clone(),
                token: config.token.clone().unwrap_or_default(),
                connection_pool: positive(config, "connection_pool", defaults::CONNECTION_POOL)?,
                aggressive_pool: config.bool_or("aggressive_pool", defaults::AGGRESSIVE_POOL)?,
                keepalive_period: positive(config, "keepalive_period", defaults::KEEPALIVE_PERIOD)?,
                dial_timeout: positive(config, "dial_timeout", defaults::DIAL_TIMEOUT)?,
                retry_interval: positive(config, "retry_interval", defaults::RETRY_INTERVAL)?,
                nodelay: config.bool_or("nodelay", defaults::NODELAY)?,
                mux: mux_settings(config)?,
                sniffer: config.bool_or("sniffer", defaults::SNIFFER)?,
                web_port: config.int_or("client_web_port", defaults::WEB_PORT)?,
                log_level: config.text_or("log_level", defaults::LOG_LEVEL)?,
                edge_ip: config.text("edge_ip")?,
            },
        })
    }
}

impl TunnelBackend for Backhaul {
    fn kind(&self) -> BackendKind {
        BackendKind::Backhaul
    }

    fn binary_name(&self, _role: Role) -> &'static str {
        "backhaul"
    }

    fn release(&self, arch: CpuArch, role: Role) -> Release {
        Release {
            binary: self.binary_name(role).to_string(),
            url: format!(
                "https://github.com/Musixal/Backhaul/releases/latest/download/backhaul_linux_{}.tar.gz",
                arch.go_name()
            ),
            archive: Archive::TarGz {
                member: "backhaul".to_string(),
            },
        }
    }

    fn prepare(&self, config: &mut TunnelConfig) -> Result<()> {
        require_transport(config, TRANSPORTS, defaults::TRANSPORT)?;
        ensure_token(config);
        Ok(())
    }

    fn needs_key_pair(&self, config: &TunnelConfig) -> bool {
        matches!(config.transport.as_str(), "wss" | "wssmux")
    }

    fn render(
        &self,
        config: &TunnelConfig,
        host: &HostDescriptor,
        layout: &Layout,
    ) -> Result<Vec<Artifact>> {
        let server = toml::to_string(&self.server_file(config, layout)?)
            .context(errors::config::render_failed("backhaul server"))?;
        let client = toml::to_string(&self.client_file(config, host)?)
            .context(errors::config::render_failed("backhaul client"))?;

        Ok(vec![
            Artifact {
                side: Side::Remote,
                role: Role::Server,
                file_name: layout.artifact_name(Role::Server, "toml"),
                contents: server,
            },
            Artifact {
                side: Side::Local,
                role: Role::Client,
                file_name: layout.artifact_name(Role::Client, "toml"),
                contents: client,
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
    use crate::provision::types::PortRule;
    use crate::settings::Settings;

    fn host() -> HostDescriptor {
        HostDescriptor::with_password("203.0.113.7", 22, "pw")
    }

    fn plan(config: TunnelConfig) -> (TunnelConfig, Vec<Artifact>) {
        Installer::new(BackendKind::Backhaul)
            .plan(&config, &host(), &Settings::default())
            .unwrap()
    }

    #[test]
    fn test_mandatory_only_renders_documented_defaults() {
        let (prepared, artifacts) = plan(TunnelConfig::new(BackendKind::Backhaul, 443, "tcp"));
        let token = prepared.token.clone().unwrap();
        assert_eq!(token.len(), 32);

        let server: toml::Value = toml::from_str(&artifacts[0].contents).unwrap();
        let server = &server["server"];
        assert_eq!(server["bind_addr"].as_str(), Some("0.0.0.0:443"));
        assert_eq!(server["transport"].as_str(), Some("tcp"));
        assert_eq!(server["token"].as_str(), Some(token.as_str()));
        assert_eq!(server["keepalive_period"].as_integer(), Some(75));
        assert_eq!(server["nodelay"].as_bool(), Some(true));
        assert_eq!(server["heartbeat"].as_integer(), Some(40));
        assert_eq!(server["channel_size"].as_integer(), Some(2048));
        assert_eq!(server["accept_udp"].as_bool(), Some(false));
        assert_eq!(server["web_port"].as_integer(), Some(0));
        assert_eq!(server["log_level"].as_str(), Some("info"));
        assert!(server.get("mux_con").is_none());
        assert!(server.get("tls_cert").is_none());

        let client: toml::Value = toml::from_str(&artifacts[1].contents).unwrap();
        let client = &client["client"];
        assert_eq!(client["remote_addr"].as_str(), Some("203.0.113.7:443"));
        assert_eq!(client["connection_pool"].as_integer(), Some(8));
        assert_eq!(client["aggressive_pool"].as_bool(), Some(false));
        assert_eq!(client["dial_timeout"].as_integer(), Some(10));
        assert_eq!(client["retry_interval"].as_integer(), Some(3));
    }

    #[test]
    fn test_injected_fields_appear_verbatim() {
        let mut config = TunnelConfig::new(BackendKind::Backhaul, 8443, "wsmux")
            .with_option("channel_size", 4096)
            .with_option("nodelay", false)
            .with_option("ports", vec![PortRule::new(80), "2222=10.0.0.5:22".parse().unwrap()]);
        config.token = Some("s3cret".to_string());

        let (prepared, artifacts) = plan(config);
        assert_eq!(prepared.token.as_deref(), Some("s3cret"));

        let server = &artifacts[0].contents;
        assert!(server.contains("token = \"s3cret\""));
        assert!(server.contains("channel_size = 4096"));
        assert!(server.contains("nodelay = false"));
        assert!(server.contains("mux_con = 8"));
        assert!(server.contains("mux_recievebuffer = 4194304"));
        assert!(server.contains("\"2222=10.0.0.5:22\""));
        assert!(artifacts[1].contents.contains("transport = \"wsmux\""));
    }

    #[test]
    fn test_wss_points_at_key_pair() {
        let (prepared, artifacts) = plan(TunnelConfig::new(BackendKind::Backhaul, 443, "WSS"));
        assert_eq!(prepared.transport, "wss");
        assert!(Backhaul.needs_key_pair(&prepared));
        assert!(artifacts[0].contents.contains("tls_cert = \"/etc/tunnel-provisioner/backhaul/backhaul-443.crt\""));
    }

    #[test]
    fn test_rejects_unknown_transport_and_bad_values() {
        let installer = Installer::new(BackendKind::Backhaul);
        let bad_transport = TunnelConfig::new(BackendKind::Backhaul, 443, "quic");
        let err = installer
            .plan(&bad_transport, &host(), &Settings::default())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("quic"));

        let bad_heartbeat = TunnelConfig::new(BackendKind::Backhaul, 443, "tcp").with_option("heartbeat", "abc");
        let err = installer
            .plan(&bad_heartbeat, &host(), &Settings::default())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("heartbeat"));
    }

    #[test]
    fn test_empty_transport_defaults_to_tcp() {
        let (prepared, _) = plan(TunnelConfig::new(BackendKind::Backhaul, 443, ""));
        assert_eq!(prepared.transport, "tcp");
    }

    #[test]
    fn test_service_invocation() {
        assert_eq!(Backhaul.exec_args(Role::Server, "/etc/x.toml"), "-c /etc/x.toml");
        let release = Backhaul.release(CpuArch::Arm64, Role::Server);
        assert!(release.url.ends_with("backhaul_linux_arm64.tar.gz"));
    }
}
