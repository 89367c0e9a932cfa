use std::path::PathBuf;

pub const APP_NAME: &str = "tunnel_provisioner";

pub const DEFAULT_RECORDS_FILE: &str = "tunnels.yaml";

pub const MOCK_ENV_VAR: &str = "TUNNEL_PROVISIONER_MOCK";

/// Bound on checkpoints buffered between an installer and the engine.
pub const CHECKPOINT_CHANNEL_CAPACITY: usize = 16;

pub fn default_log_directory() -> PathBuf {
    PathBuf::from(".").join("logs")
}
