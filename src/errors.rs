use std::time::Duration;

pub mod host {
    pub const ADDRESS_EMPTY: &str = "Host address cannot be empty";
    pub const PORT_ZERO: &str = "Host SSH port cannot be 0";
    pub const USER_EMPTY: &str = "Host username cannot be empty";
    pub const NO_CREDENTIALS: &str =
        "Host has no credentials. Supply a password, a private key, or both.";
}

pub mod config {
    use crate::provision::types::OptionValue;

    pub const INVALID_TUNNEL: &str = "Invalid tunnel configuration";
    pub const INVALID_HOST: &str = "Invalid host descriptor";
    pub const TOKEN_CHARSET: &str = "Token cannot contain whitespace or quote characters";

    pub fn invalid_port(raw: &str) -> String {
        format!("Invalid port '{}': expected a number between 1 and 65535", raw)
    }

    pub fn invalid_port_rule(rule: &str) -> String {
        format!(
            "Invalid port rule '{}': expected listen, listen=port or listen=host:port",
            rule
        )
    }

    pub fn not_an_integer(key: &str, raw: &str) -> String {
        format!("Option '{}' must be an integer, got '{}'", key, raw)
    }

    pub fn wrong_type(key: &str, expected: &str, actual: &OptionValue) -> String {
        format!("Option '{}' must be {}, got {:?}", key, expected, actual)
    }

    pub fn invalid_option(key: &str) -> String {
        format!("Invalid value for option '{}'", key)
    }

    pub fn missing_option(backend: &str, key: &str) -> String {
        format!("{} requires the '{}' option", backend, key)
    }

    pub fn must_be_positive(key: &str, value: i64) -> String {
        format!("Option '{}' must be greater than 0, got {}", key, value)
    }

    pub fn name_too_long(len: usize) -> String {
        format!("Tunnel name too long (max 100 characters): {} characters", len)
    }

    pub fn unsupported_transport(backend: &str, transport: &str, allowed: &[&str]) -> String {
        format!(
            "{} does not support transport '{}'. Supported: {}",
            backend,
            transport,
            allowed.join(", ")
        )
    }

    pub fn ports_required(backend: &str) -> String {
        format!("{} requires at least one port rule in the 'ports' option", backend)
    }

    pub fn duplicate_listen_port(backend: &str, port: u16) -> String {
        format!("{} cannot forward listen port {} twice", backend, port)
    }

    pub fn backend_mismatch(config: &str, installer: &str) -> String {
        format!(
            "Backend mismatch: configuration is for {} but installer is {}",
            config, installer
        )
    }

    pub fn render_failed(what: &str) -> String {
        format!("Failed to render {} configuration", what)
    }
}

pub mod settings {
    pub const VALIDATION_FAILED: &str = "Settings validation failed";
    pub const ZERO_TIMEOUT: &str = "Timeouts must be greater than zero";
    pub const CONNECT_EXCEEDS_COMMAND: &str =
        "connect_timeout cannot be longer than command_timeout";
    pub const ZERO_SWEEP: &str = "sweep_interval must be greater than zero";

    pub fn failed_to_load(path: &str) -> String {
        if path.is_empty() {
            "Failed to load settings from the environment".to_string()
        } else {
            format!("Failed to load settings from {}", path)
        }
    }

    pub fn must_be_absolute(field: &str, path: &str) -> String {
        format!("{} must be an absolute path, got '{}'", field, path)
    }

    pub fn nofile_too_low(limit: u64) -> String {
        format!("nofile_limit must be at least 1024, got {}", limit)
    }
}

pub mod exec {
    use super::Duration;

    pub fn exited_silently(status: &str) -> String {
        format!("Command exited with status {} and no output", status)
    }

    pub fn local_spawn_failed(error: &str) -> String {
        format!("Failed to spawn local shell: {}", error)
    }

    pub fn local_wait_failed(error: &str) -> String {
        format!("Failed waiting for local command: {}", error)
    }

    pub fn local_timed_out(timeout: Duration) -> String {
        format!(
            "Local command timed out after {}",
            humantime::format_duration(timeout)
        )
    }
}

pub mod remote {
    use super::Duration;

    pub const KEY_FILE_FAILED: &str = "Failed to write private key to a temporary file";
    pub const WAIT_FAILED: &str = "Failed waiting for the SSH client";

    pub fn no_usable_credentials(host: &str) -> String {
        format!(
            "No usable credentials for {}: private key could not be parsed and no password was given",
            host
        )
    }

    pub fn client_missing(ssh: &str, sshpass: &str) -> String {
        format!(
            "SSH client not found. Make sure '{}' (and '{}' for password logins) is installed and on PATH.",
            ssh, sshpass
        )
    }

    pub fn spawn_failed(error: &str) -> String {
        format!("Failed to spawn SSH client: {}", error)
    }

    pub fn timed_out(host: &str, timeout: Duration) -> String {
        format!(
            "Command on {} timed out after {}",
            host,
            humantime::format_duration(timeout)
        )
    }
}

pub mod install {
    pub const PERSIST_FAILED: &str = "Tunnel installed but its record could not be saved";

    pub fn step_failed(step: &str, output: &str) -> String {
        if output.is_empty() {
            format!("{} failed", step)
        } else {
            format!("{} failed: {}", step, output)
        }
    }

    pub fn connect_step(host: &str) -> String {
        format!("Connecting to {}", host)
    }

    pub fn arch_step(side: &str) -> String {
        format!("Detecting CPU architecture on {} host", side)
    }

    pub fn unsupported_arch(arch: &str) -> String {
        format!("Unsupported CPU architecture '{}': expected x86_64 or aarch64", arch)
    }

    pub fn download_step(binary: &str, side: &str) -> String {
        format!("Downloading {} on {} host", binary, side)
    }

    pub fn write_step(path: &str, side: &str) -> String {
        format!("Writing {} on {} host", path, side)
    }

    pub fn firewall_step(ports: &str, side: &str) -> String {
        format!("Opening ports {} on {} host", ports, side)
    }

    pub fn activate_step(unit: &str, side: &str) -> String {
        format!("Starting {} on {} host", unit, side)
    }

    pub const KEY_PAIR_FAILED: &str = "Failed to generate self-signed TLS key pair";
}

pub mod records {
    pub const FAILED_TO_SERIALIZE: &str = "Failed to serialize tunnel records to YAML";
    pub const SAVE_FAILED: &str = "Failed to save tunnel records to disk";
    pub const LOCK_POISONED: &str = "Tunnel record store lock poisoned";
    #[cfg(unix)]
    pub const FAILED_TO_OPEN_TEMP: &str = "Failed to open temp file for fsync";
    #[cfg(unix)]
    pub const FAILED_TO_FSYNC: &str = "Failed to fsync temp file";

    pub fn corrupted(path: &str) -> String {
        format!("Corrupted tunnel record file at {}", path)
    }

    pub fn unsupported_version(version: u32) -> String {
        format!(
            "Unsupported record file version: {}. Expected version 1",
            version
        )
    }

    pub fn failed_to_read(path: &str) -> String {
        format!("Failed to read tunnel records from {}", path)
    }

    pub fn failed_to_create_dir(path: &str) -> String {
        format!("Failed to create record directory {}", path)
    }

    pub fn failed_to_write_temp(path: &str) -> String {
        format!("Failed to write temporary record file to {}", path)
    }

    pub fn failed_to_rename(from: &str, to: &str) -> String {
        format!("Failed to rename {} to {}", from, to)
    }

    pub fn not_found(id: &str) -> String {
        format!("Tunnel record {} not found", id)
    }
}

pub mod disk {
    pub const FULL: &str =
        "Disk space exhausted. Cannot save tunnel records. Free up disk space and try again.";
}

pub mod engine {
    use super::Duration;

    pub const CANCELLED: &str = "Installation cancelled";

    pub fn timed_out(limit: Duration) -> String {
        format!(
            "Installation timed out after {}",
            humantime::format_duration(limit)
        )
    }

    pub fn installer_aborted(error: &str) -> String {
        format!("Installer stopped unexpectedly: {}", error)
    }
}

pub mod logs {
    pub const FAILED_TO_CREATE_DIR: &str = "Failed to create log directory";
}

pub mod cli {
    pub fn read_tunnel_file(path: &str) -> String {
        format!("Failed to read tunnel file {}", path)
    }

    pub fn parse_tunnel_file(path: &str) -> String {
        format!("Failed to parse tunnel file {}", path)
    }

    pub fn read_key_file(path: &str) -> String {
        format!("Failed to read private key file {}", path)
    }

    pub fn invalid_record_id(raw: &str) -> String {
        format!("Invalid tunnel record id '{}'", raw)
    }

    pub fn install_failed(message: &str) -> String {
        format!("Install did not complete: {}", message)
    }
}
