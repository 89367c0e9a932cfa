use super::{
    Archive, Artifact, CpuArch, Layout, Release, Role, Side, TunnelBackend, ensure_token,
    require_ports, require_transport,
};
use crate::errors;
use crate::provision::types::{BackendKind, HostDescriptor, TunnelConfig};
use anyhow::{Context, Result};
use itertools::Itertools;
use serde::Serialize;

pub mod defaults {
    pub const TRANSPORT: &str = "udp";
    pub const UP_MBPS: i64 = 100;
    pub const DOWN_MBPS: i64 = 100;
    pub const SNI: &str = "www.bing.com";
}

#[derive(Debug, Serialize)]
struct Tls {
    cert: String,
    key: String,
}

#[derive(Debug, Serialize)]
struct Auth {
    #[serde(rename = "type")]
    kind: &'static str,
    password: String,
}

#[derive(Debug, Serialize)]
struct Bandwidth {
    up: String,
    down: String,
}

#[derive(Debug, Serialize)]
struct Salamander {
    password: String,
}

#[derive(Debug, Serialize)]
struct Obfs {
    #[serde(rename = "type")]
    kind: &'static str,
    salamander: Salamander,
}

#[derive(Debug, Serialize)]
struct ServerFile {
    listen: String,
    tls: Tls,
    auth: Auth,
    bandwidth: Bandwidth,
    #[serde(skip_serializing_if = "Option::is_none")]
    obfs: Option<Obfs>,
}

#[derive(Debug, Serialize)]
struct ClientTls {
    sni: String,
    insecure: bool,
}

#[derive(Debug, Serialize)]
struct Forward {
    listen: String,
    remote: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientFile {
    server: String,
    auth: String,
    tls: ClientTls,
    bandwidth: Bandwidth,
    #[serde(skip_serializing_if = "Option::is_none")]
    obfs: Option<Obfs>,
    tcp_forwarding: Vec<Forward>,
}

fn bandwidth(config: &TunnelConfig) -> Result<Bandwidth> {
    let up = config.int_or("up_mbps", defaults::UP_MBPS)?;
    let down = config.int_or("down_mbps", defaults::DOWN_MBPS)?;
    anyhow::ensure!(up > 0, errors::config::must_be_positive("up_mbps", up));
    anyhow::ensure!(down > 0, errors::config::must_be_positive("down_mbps", down));
    Ok(Bandwidth {
        up: format!("{} mbps", up),
        down: format!("{} mbps", down),
    })
}

fn obfs(config: &TunnelConfig) -> Result<Option<Obfs>> {
    Ok(config.text("obfs_password")?.map(|password| Obfs {
        kind: "salamander",
        salamander: Salamander { password },
    }))
}

pub struct Hysteria;

impl TunnelBackend for Hysteria {
    fn kind(&self) -> BackendKind {
        BackendKind::Hysteria
    }

    fn binary_name(&self, _role: Role) -> &'static str {
        "hysteria"
    }

    fn release(&self, arch: CpuArch, role: Role) -> Release {
        Release {
            binary: self.binary_name(role).to_string(),
            url: format!(
                "https://github.com/apernet/hysteria/releases/latest/download/hysteria-linux-{}",
                arch.go_name()
            ),
            archive: Archive::Raw,
        }
    }

    fn prepare(&self, config: &mut TunnelConfig) -> Result<()> {
        require_transport(config, &[defaults::TRANSPORT], defaults::TRANSPORT)?;
        require_ports(config)?;
        ensure_token(config);
        Ok(())
    }

    fn needs_key_pair(&self, _config: &TunnelConfig) -> bool {
        true
    }

    fn render(
        &self,
        config: &TunnelConfig,
        host: &HostDescriptor,
        layout: &Layout,
    ) -> Result<Vec<Artifact>> {
        let password = config.token.clone().unwrap_or_default();

        let server = ServerFile {
            listen: format!(":{}", config.listen_port),
            tls: Tls {
                cert: layout.cert_path(),
                key: layout.key_path(),
            },
            auth: Auth {
                kind: "password",
                password: password.clone(),
            },
            bandwidth: bandwidth(config)?,
            obfs: obfs(config)?,
        };

        let client = ClientFile {
            server: format!("{}:{}", host.address, config.listen_port),
            auth: password,
            tls: ClientTls {
                sni: config.text_or("sni", defaults::SNI)?,
                insecure: true,
            },
            bandwidth: bandwidth(config)?,
            obfs: obfs(config)?,
            tcp_forwarding: require_ports(config)?
                .iter()
                .map(|rule| Forward {
                    listen: format!("0.0.0.0:{}", rule.listen),
                    remote: rule.target_addr(),
                })
                .collect(),
        };

        Ok(vec![
            Artifact {
                side: Side::Remote,
                role: Role::Server,
                file_name: layout.artifact_name(Role::Server, "yaml"),
                contents: serde_yaml::to_string(&server)
                    .context(errors::config::render_failed("hysteria server"))?,
            },
            Artifact {
                side: Side::Local,
                role: Role::Client,
                file_name: layout.artifact_name(Role::Client, "yaml"),
                contents: serde_yaml::to_string(&client)
                    .context(errors::config::render_failed("hysteria client"))?,
            },
        ])
    }

    fn exec_args(&self, role: Role, config_path: &str) -> String {
        format!("{} -c {}", role, config_path)
    }

    /// The server listens on the tunnel port; forwarded ports are bound by
    /// the client on the local host.
    fn firewall_ports(&self, config: &TunnelConfig, side: Side) -> Result<Vec<u16>> {
        Ok(match side {
            Side::Remote => vec![config.listen_port],
            Side::Local => config
                .ports("ports")?
                .iter()
                .map(|r| r.listen)
                .unique()
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::installer::Installer;
    use crate::settings::Settings;

    fn plan(config: TunnelConfig) -> Vec<Artifact> {
        let host = HostDescriptor::with_password("203.0.113.7", 22, "pw");
        Installer::new(BackendKind::Hysteria)
            .plan(&config, &host, &Settings::default())
            .unwrap()
            .1
    }

    #[test]
    fn test_defaults_in_both_artifacts() {
        let artifacts = plan(
            TunnelConfig::new(BackendKind::Hysteria, 8443, "").with_option("ports", "8080=80"),
        );

        let server: serde_yaml::Value = serde_yaml::from_str(&artifacts[0].contents).unwrap();
        assert_eq!(server["listen"].as_str(), Some(":8443"));
        assert_eq!(server["bandwidth"]["up"].as_str(), Some("100 mbps"));
        assert_eq!(
            server["tls"]["cert"].as_str(),
            Some("/etc/tunnel-provisioner/hysteria/hysteria-8443.crt")
        );
        assert!(server.get("obfs").is_none());

        let client: serde_yaml::Value = serde_yaml::from_str(&artifacts[1].contents).unwrap();
        assert_eq!(client["server"].as_str(), Some("203.0.113.7:8443"));
        assert_eq!(client["tls"]["sni"].as_str(), Some("www.bing.com"));
        assert_eq!(client["auth"], server["auth"]["password"]);
        assert_eq!(client["tcpForwarding"][0]["listen"].as_str(), Some("0.0.0.0:8080"));
        assert_eq!(client["tcpForwarding"][0]["remote"].as_str(), Some("127.0.0.1:80"));
    }

    #[test]
    fn test_obfs_and_rejects_tcp() {
        let artifacts = plan(
            TunnelConfig::new(BackendKind::Hysteria, 8443, "udp")
                .with_option("ports", "8080")
                .with_option("obfs_password", "salty"),
        );
        let server: serde_yaml::Value = serde_yaml::from_str(&artifacts[0].contents).unwrap();
        assert_eq!(server["obfs"]["type"].as_str(), Some("salamander"));
        assert_eq!(server["obfs"]["salamander"]["password"].as_str(), Some("salty"));

        let host = HostDescriptor::with_password("203.0.113.7", 22, "pw");
        let tcp = TunnelConfig::new(BackendKind::Hysteria, 8443, "tcp").with_option("ports", "8080");
        assert!(
            Installer::new(BackendKind::Hysteria)
                .plan(&tcp, &host, &Settings::default())
                .is_err()
        );
    }

    #[test]
    fn test_firewall_split_between_hosts() {
        let config = TunnelConfig::new(BackendKind::Hysteria, 8443, "udp")
            .with_option("ports", "8080=80, 9090");
        assert_eq!(Hysteria.firewall_ports(&config, Side::Remote).unwrap(), vec![8443]);
        assert_eq!(
            Hysteria.firewall_ports(&config, Side::Local).unwrap(),
            vec![8080, 9090]
        );
        assert_eq!(Hysteria.exec_args(Role::Client, "/c.yaml"), "client -c /c.yaml");
    }
}
