use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use relay_server::ServerConfig;
use relay_store::{KeyValueStore, SqliteStore};
use relay_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "relay", about = "Persistent-connection broker for on-demand function execution")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = default_port())]
    port: u16,

    /// Path to the relay database.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn default_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_db_path() -> PathBuf {
    std::env::var("RELAY_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_home().join(".relay").join("relay.db"))
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json_output: cli.json_logs,
        ..Default::default()
    });

    let db_path = cli.db.unwrap_or_else(default_db_path);
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&db_path)?);
    tracing::info!(path = %db_path.display(), "store ready");

    let config = ServerConfig {
        port: cli.port,
        ..Default::default()
    };
    let handle = relay_server::start(config, store).await?;
    tracing::info!(port = handle.port, "relay ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown();

    Ok(())
}
