//! spark-agent binary.

use clap::Parser;
use spark_agent::{Agent, AgentConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// spark-agent: remote device agent
#[derive(Parser, Debug)]
#[command(name = "spark-agent", version, about = "Spark device agent")]
struct Cli {
    /// Server base URL (http:// or https://)
    #[arg(short, long)]
    server: Option<String>,

    /// Override the derived device id
    #[arg(long)]
    device_id: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.spark/agent.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match AgentConfig::load(
        Some(&config_path),
        cli.server.as_deref(),
        cli.device_id.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let agent = Agent::new(config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %agent.config.server,
        device = %agent.device_id(),
        "starting spark-agent"
    );

    tokio::select! {
        _ = agent.clone().run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            agent.terminals.close_all().await;
        }
    }
    info!("spark-agent stopped");
}
