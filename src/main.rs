use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_control_plane::api_server::ApiServer;
use fleet_control_plane::clock::SystemClock;
use fleet_control_plane::config::Config;
use fleet_control_plane::metrics::FleetMetrics;
use fleet_control_plane::security::audit::log_audit_sink;
use fleet_control_plane::security::credentials::short_fingerprint;
use fleet_control_plane::storage::{spawn_expiry_sweeper, CredentialStore, RocksCredentialStore};

const INIT_KEY_LABEL: &str = "init-key";

#[derive(Parser)]
#[command(name = "fleet-cp")]
#[command(about = "Fleet control plane: agent admission, heartbeats and credential management")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane API server
    Start {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Agent version advertised in heartbeat responses
        #[arg(long)]
        latest_version: Option<String>,
    },
    /// Issue a new agent credential and print its secret
    Keygen {
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Rotate a credential; the old secret stays valid for 24 hours
    Rotate {
        #[arg(long)]
        secret: String,
    },
    /// Delete every expired credential
    Sweep,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.server.data_dir = data_dir;
    }
    if let Commands::Start { host, port, latest_version } = &cli.command {
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(version) = latest_version {
            config.server.latest_agent_version = version.clone();
        }
    }
    config.validate()?;

    let store: Arc<dyn CredentialStore> =
        Arc::new(RocksCredentialStore::open(&config.server.data_dir)?);

    match cli.command {
        Commands::Start { .. } => run_server(config, store).await?,
        Commands::Keygen { name, owner } => {
            let secret = store.create_owned(&name, owner).await?;
            println!("🔑 Generated credential '{}'", name);
            println!("   Secret: {}", secret);
            println!("   Store this secret now; it cannot be shown again.");
        }
        Commands::Rotate { secret } => {
            let new_secret = store.rotate(&secret).await?;
            println!("🔄 Rotated credential {}", short_fingerprint(&secret));
            println!("   New secret: {}", new_secret);
            println!("   The old secret remains valid for 24 hours.");
        }
        Commands::Sweep => {
            let removed = store.sweep_expired().await?;
            println!("🧹 Removed {} expired credentials", removed);
        }
    }

    Ok(())
}

async fn run_server(
    config: Config,
    store: Arc<dyn CredentialStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("🚀 Starting fleet control plane");

    if let Some(init_key) = &config.security.init_api_key {
        if store.is_valid_format(init_key) {
            store.ensure(init_key, INIT_KEY_LABEL).await?;
            info!("🔑 Bootstrap credential {} ensured", short_fingerprint(init_key));
        } else {
            warn!("⚠️  INIT_API_KEY ignored: secrets must start with sk_");
        }
    }

    let metrics = Arc::new(FleetMetrics::new()?);
    let server = ApiServer::new(
        &config,
        store.clone(),
        Arc::new(SystemClock),
        log_audit_sink(),
        metrics,
    );

    let bucket_sweeper = server
        .pipeline()
        .limiter()
        .spawn_sweeper(Duration::from_secs(config.security.bucket_sweep_interval_secs));
    let credential_sweeper = spawn_expiry_sweeper(
        store,
        Duration::from_secs(config.security.credential_sweep_interval_secs),
    );

    let result = server.serve(shutdown_signal()).await;

    bucket_sweeper.abort();
    credential_sweeper.abort();

    if let Err(e) = &result {
        error!("API server error: {}", e);
    }
    result?;

    info!("👋 Control plane stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("🛑 Shutdown signal received, draining connections");
}
