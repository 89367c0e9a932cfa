use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use tunnel_provisioner::constants;
use tunnel_provisioner::errors;
use tunnel_provisioner::provision::engine::TaskEngine;
use tunnel_provisioner::provision::installer::Installer;
use tunnel_provisioner::provision::local::LocalShell;
use tunnel_provisioner::provision::mock_executor::MockExecutor;
use tunnel_provisioner::provision::records::{FileRecordStore, RecordStore};
use tunnel_provisioner::provision::remote::SshExecutor;
use tunnel_provisioner::provision::types::{
    BackendKind, HostAuth, HostDescriptor, RecordId, TaskStatus, TunnelConfig,
};
use tunnel_provisioner::provision::{LocalExecutor, RemoteExecutor};
use tunnel_provisioner::settings::Settings;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "tunnel_provisioner")]
#[command(about = "Install tunnel backends on a remote server and this host, with progress tracking")]
struct Args {
    #[arg(long, global = true, help = "Path to a settings file (YAML or TOML)")]
    settings: Option<PathBuf>,

    #[arg(long, global = true, help = "Path to the tunnel record file")]
    records: Option<PathBuf>,

    #[arg(long, global = true, help = "Emit JSON logs on stderr")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a tunnel and follow its progress until it finishes
    Install(InstallArgs),
    /// Print the generated configuration without touching any host
    Render(RenderArgs),
    /// Inspect or delete saved tunnel records
    Records {
        #[command(subcommand)]
        action: RecordsAction,
    },
    /// List supported backends
    Backends,
}

#[derive(clap::Args, Debug)]
struct InstallArgs {
    #[arg(long)]
    backend: BackendKind,

    #[arg(long, help = "YAML file describing the tunnel")]
    tunnel: PathBuf,

    #[arg(long, help = "Remote server address")]
    host: String,

    #[arg(long, default_value_t = 22)]
    ssh_port: u16,

    #[arg(long, default_value = "root")]
    user: String,

    #[arg(long)]
    password: Option<String>,

    #[arg(long, help = "Private key file (OpenSSH or PEM)")]
    key_file: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct RenderArgs {
    #[arg(long)]
    backend: BackendKind,

    #[arg(long)]
    tunnel: PathBuf,

    #[arg(long)]
    host: String,
}

#[derive(Subcommand, Debug)]
enum RecordsAction {
    List,
    Show { id: String },
    Delete { id: String },
}

fn setup_tracing(json_logs: bool, log_directory: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_directory).context(errors::logs::FAILED_TO_CREATE_DIR)?;

    let file_appender =
        tracing_appender::rolling::daily(log_directory, format!("{}.log", constants::APP_NAME));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).json())
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).json())
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }

    Ok(guard)
}

/// Reads a tunnel description; `backend` fills in the file's backend when absent.
fn load_tunnel(path: &Path, backend: BackendKind) -> Result<TunnelConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| errors::cli::read_tunnel_file(&path.display().to_string()))?;
    let mut value: serde_yaml::Value = serde_yaml::from_str(&raw)
        .with_context(|| errors::cli::parse_tunnel_file(&path.display().to_string()))?;
    if let serde_yaml::Value::Mapping(map) = &mut value {
        map.entry("backend".into())
            .or_insert(backend.as_str().into());
    }
    serde_yaml::from_value(value)
        .with_context(|| errors::cli::parse_tunnel_file(&path.display().to_string()))
}

fn host_from_args(args: &InstallArgs) -> Result<HostDescriptor> {
    let private_key = args
        .key_file
        .as_ref()
        .map(|path| {
            std::fs::read_to_string(path)
                .with_context(|| errors::cli::read_key_file(&path.display().to_string()))
        })
        .transpose()?;
    Ok(HostDescriptor {
        address: args.host.clone(),
        port: args.ssh_port,
        username: args.user.clone(),
        auth: HostAuth {
            password: args.password.clone(),
            private_key,
        },
    })
}

fn executors(settings: &Settings) -> (Arc<dyn RemoteExecutor>, Arc<dyn LocalExecutor>) {
    if std::env::var(constants::MOCK_ENV_VAR).is_ok() {
        tracing::info!("Running in MOCK mode - no commands will reach any host");
        let mock = Arc::new(MockExecutor::new());
        (mock.clone(), mock)
    } else {
        (Arc::new(SshExecutor::new(settings)), Arc::new(LocalShell::new()))
    }
}

async fn install(args: InstallArgs, settings: Arc<Settings>) -> Result<()> {
    let config = load_tunnel(&args.tunnel, args.backend)?;
    let host = host_from_args(&args)?;
    let (remote, local) = executors(&settings);
    let records = Arc::new(FileRecordStore::new(settings.records_path.clone()));

    let engine = TaskEngine::new(
        tokio::runtime::Handle::current(),
        settings,
        remote,
        local,
        records,
    );
    let id = engine.start_install(args.backend, host, config);
    println!("Task {} started", id);

    let mut last_printed = None;
    let finished = loop {
        let snapshot = engine.get_status(id);
        if last_printed.as_ref() != Some(&snapshot) {
            println!("[{:>3}%] {}: {}", snapshot.percentage, snapshot.status, snapshot.message);
            last_printed = Some(snapshot.clone());
        }
        if snapshot.status.is_terminal() {
            break snapshot;
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => tracing::info!("Ctrl+C received, cancelling install"),
                    Err(e) => tracing::error!("Error listening for Ctrl+C: {}", e),
                }
                engine.cancel(id);
            }
        }
    };

    engine.shutdown().await;
    if finished.status == TaskStatus::Error {
        bail!(errors::cli::install_failed(&finished.message));
    }
    Ok(())
}

fn render(args: RenderArgs, settings: &Settings) -> Result<()> {
    let config = load_tunnel(&args.tunnel, args.backend)?;
    let host = HostDescriptor {
        address: args.host,
        port: 22,
        username: "root".to_string(),
        auth: HostAuth {
            password: None,
            private_key: None,
        },
    };

    let installer = Installer::new(args.backend);
    let (config, artifacts) = installer.plan(&config, &host, settings)?;
    for artifact in &artifacts {
        println!("# {} {}: {}", artifact.side, artifact.role, artifact.file_name);
        println!("{}", artifact.contents.trim_end());
        println!();
    }
    for (side, path, unit) in installer.service_units(&config, settings, &artifacts) {
        println!("# {} unit: {}", side, path);
        println!("{}", unit.trim_end());
        println!();
    }
    Ok(())
}

fn parse_record_id(raw: &str) -> Result<RecordId> {
    raw.parse()
        .with_context(|| errors::cli::invalid_record_id(raw))
}

async fn records(action: RecordsAction, settings: &Settings) -> Result<()> {
    let store = FileRecordStore::new(settings.records_path.clone());
    match action {
        RecordsAction::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No tunnel records in {}", store.path().display());
            }
            for record in records {
                println!(
                    "{}  {:<24} {:<9} {:>5}  {:?}  {}",
                    record.id,
                    record.name,
                    record.backend,
                    record.listen_port,
                    record.status,
                    record.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        RecordsAction::Show { id } => {
            let id = parse_record_id(&id)?;
            let record = store
                .get(id)
                .await?
                .with_context(|| errors::records::not_found(&id.to_string()))?;
            print!("{}", serde_yaml::to_string(&record)?);
        }
        RecordsAction::Delete { id } => {
            let id = parse_record_id(&id)?;
            if !store.delete(id).await? {
                bail!(errors::records::not_found(&id.to_string()));
            }
            println!("Deleted tunnel record {}", id);
        }
    }
    Ok(())
}

fn backends() {
    for kind in BackendKind::all() {
        println!("{:<9} {:?}", kind, kind.backend().topology());
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(args.settings.as_deref())?;
    if let Some(records) = args.records {
        settings.records_path = records;
    }
    let _guard = setup_tracing(args.json_logs, &settings.log_directory)
        .context("Failed to initialize tracing")?;
    tracing::info!("{} starting", constants::APP_NAME);

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let settings = Arc::new(settings);

    match args.command {
        Command::Install(install_args) => runtime.block_on(install(install_args, settings)),
        Command::Render(render_args) => render(render_args, &settings),
        Command::Records { action } => runtime.block_on(records(action, &settings)),
        Command::Backends => {
            backends();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_install_args() {
        let args = Args::parse_from([
            "tunnel_provisioner",
            "install",
            "--backend",
            "backhaul",
            "--tunnel",
            "edge.yaml",
            "--host",
            "203.0.113.7",
            "--password",
            "pw",
        ]);
        let Command::Install(install) = args.command else {
            panic!("expected install");
        };
        assert_eq!(install.backend, BackendKind::Backhaul);
        assert_eq!(install.ssh_port, 22);
        assert_eq!(install.user, "root");
        assert_eq!(install.tunnel, PathBuf::from("edge.yaml"));
        assert!(install.key_file.is_none());
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let args = Args::parse_from([
            "tunnel_provisioner",
            "records",
            "list",
            "--records",
            "custom.yaml",
            "--json-logs",
        ]);
        assert!(args.json_logs);
        assert_eq!(args.records, Some(PathBuf::from("custom.yaml")));
        assert!(matches!(
            args.command,
            Command::Records {
                action: RecordsAction::List
            }
        ));
    }

    #[test]
    fn test_cli_rejects_unknown_backend() {
        let result = Args::try_parse_from([
            "tunnel_provisioner",
            "render",
            "--backend",
            "wireguard",
            "--tunnel",
            "t.yaml",
            "--host",
            "h",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_tunnel_fills_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.yaml");
        std::fs::write(
            &path,
            "name: edge\ntransport: tcp\nlisten_port: 443\noptions:\n  ports: \"8080=80\"\n",
        )
        .unwrap();

        let config = load_tunnel(&path, BackendKind::Rathole).unwrap();
        assert_eq!(config.backend, BackendKind::Rathole);
        assert_eq!(config.listen_port, 443);
        assert_eq!(config.ports("ports").unwrap().len(), 1);
    }
}
