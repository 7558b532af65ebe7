//! Discovers Z3K controllers on the local network and logs each session as
//! it comes up.
//!
//! Usage: `z3k-scan [--config <path>] [--version]`

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use z3k_link::{Config, DeviceServer, RawConfigCodec, Result, VERSION};

const REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "z3k-scan failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version") {
        println!("z3k-scan {}", VERSION);
        return Ok(());
    }

    let config = match config_path(&args)? {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Config::load(&path)?
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    };

    let (server, handle) = DeviceServer::new(config, RawConfigCodec);
    let mut server_task = tokio::spawn(server.run());

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            result = &mut server_task => {
                return result.map_err(|e| z3k_link::Error::network(format!("Device server task failed: {}", e)))?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                handle.shutdown();
                break;
            }
            _ = report.tick() => {
                for session in handle.sessions().await? {
                    info!(
                        serial = %session.serial,
                        ip = %session.ip,
                        model = %session.model,
                        last_seen = %session.last_seen,
                        stage = %session.stage,
                        firmware = ?session.info.as_ref().map(|info| info.firmware),
                        "session"
                    );
                }
            }
        }
    }

    server_task
        .await
        .map_err(|e| z3k_link::Error::network(format!("Device server task failed: {}", e)))?
}

fn config_path(args: &[String]) -> Result<Option<PathBuf>> {
    match args.iter().position(|a| a == "--config") {
        Some(i) => args
            .get(i + 1)
            .map(|path| Some(PathBuf::from(path)))
            .ok_or_else(|| z3k_link::Error::config("--config needs a path")),
        None => Ok(None),
    }
}
