//! Binary entrypoint for the auditord attestation server.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use auditord_server::ServerConfig;

#[derive(Parser)]
#[command(name = "auditord", about = "Remote attestation server for auditor devices")]
struct Cli {
    /// Listen address. Keep on loopback; TLS terminates upstream.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Directory holding the attestation and samples databases.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Directory receiving maintenance backups.
    #[arg(long, default_value = "backup")]
    backup_dir: PathBuf,

    /// Canonical origin for browser requests.
    #[arg(long, default_value = "https://attestation.example")]
    origin: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ServerConfig {
        listen: cli.listen,
        data_dir: cli.data_dir,
        backup_dir: cli.backup_dir,
        origin: cli.origin,
    };

    if let Err(error) = auditord_server::run(config).await {
        eprintln!("fatal: {error}");
        std::process::exit(1);
    }
}
