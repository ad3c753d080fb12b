//! spark-server binary.

use clap::Parser;
use spark_server::ServerConfig;
use std::path::PathBuf;
use tracing::{error, info};

/// spark-server: remote device control server
#[derive(Parser, Debug)]
#[command(name = "spark-server", version, about = "Spark control server")]
struct Cli {
    /// Listen address
    #[arg(long)]
    listen: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.spark/server.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), cli.listen.as_deref(), cli.port) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        port = config.port,
        "starting spark-server"
    );

    if let Err(e) = spark_server::run(config, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("spark-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("received shutdown signal");
}
