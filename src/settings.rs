use anyhow::{Context, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::errors;

/// Environment overrides use this prefix with `__` as the separator,
/// e.g. `TUNNEL_PROVISIONER__PACING_DELAY=250ms`.
pub const ENV_PREFIX: &str = "TUNNEL_PROVISIONER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory receiving backend binaries on both hosts.
    pub install_dir: PathBuf,
    /// Root for generated backend configuration and key pairs.
    pub config_dir: PathBuf,
    pub unit_dir: PathBuf,

    pub ssh_binary: PathBuf,
    pub sshpass_binary: PathBuf,
    #[serde(with = "humantime_duration")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub command_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub download_timeout: Duration,

    #[serde(with = "humantime_duration")]
    pub pacing_delay: Duration,
    #[serde(with = "humantime_duration_opt")]
    pub install_timeout: Option<Duration>,
    #[serde(with = "humantime_duration")]
    pub task_ttl: Duration,
    #[serde(with = "humantime_duration")]
    pub sweep_interval: Duration,

    pub restart_delay_secs: u32,
    pub nofile_limit: u64,

    pub records_path: PathBuf,
    pub log_directory: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("/usr/local/bin"),
            config_dir: PathBuf::from("/etc/tunnel-provisioner"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            ssh_binary: PathBuf::from("ssh"),
            sshpass_binary: PathBuf::from("sshpass"),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(120),
            download_timeout: Duration::from_secs(600),
            pacing_delay: Duration::from_millis(500),
            install_timeout: None,
            task_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            restart_delay_secs: 3,
            nofile_limit: 1_048_576,
            records_path: PathBuf::from(constants::DEFAULT_RECORDS_FILE),
            log_directory: constants::default_log_directory(),
        }
    }
}

impl Settings {
    /// Layers an optional settings file (YAML or TOML, picked by extension)
    /// and environment overrides on top of the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| {
                errors::settings::failed_to_load(
                    &path.map(|p| p.display().to_string()).unwrap_or_default(),
                )
            })?;

        settings
            .validate()
            .context(errors::settings::VALIDATION_FAILED)?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.install_dir.is_absolute(),
            errors::settings::must_be_absolute("install_dir", &self.install_dir.display().to_string())
        );
        ensure!(
            self.config_dir.is_absolute(),
            errors::settings::must_be_absolute("config_dir", &self.config_dir.display().to_string())
        );
        ensure!(
            self.unit_dir.is_absolute(),
            errors::settings::must_be_absolute("unit_dir", &self.unit_dir.display().to_string())
        );
        ensure!(
            !self.connect_timeout.is_zero() && !self.command_timeout.is_zero(),
            errors::settings::ZERO_TIMEOUT
        );
        ensure!(
            self.connect_timeout <= self.command_timeout,
            errors::settings::CONNECT_EXCEEDS_COMMAND
        );
        ensure!(!self.sweep_interval.is_zero(), errors::settings::ZERO_SWEEP);
        ensure!(self.nofile_limit >= 1024, errors::settings::nofile_too_low(self.nofile_limit));
        Ok(())
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod humantime_duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.collect_str(&humantime::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() || raw.trim() == "none" => Ok(None),
            Some(raw) => humantime::parse_duration(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
