use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod api;
mod config;

use config::ServerConfig;

const DEFAULT_LOG_FILTER: &str = "stepflow=info,stepflow_core=info,tower_http=debug";

#[derive(Parser, Debug)]
#[command(name = "stepflow")]
#[command(about = "Deterministic workflow engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "STEPFLOW_CONFIG", default_value = "stepflow.toml")]
    config: PathBuf,

    /// Directory holding the run index and event journal
    #[arg(short, long, env = "STEPFLOW_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[arg(short, long, env = "STEPFLOW_PORT", default_value = "8080")]
    port: u16,

    #[arg(long, env = "STEPFLOW_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "STEPFLOW_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = ServerConfig::load(&args.config, args.data_dir.clone())?;
    tracing::info!(
        "Starting stepflow with {:?} storage in {}",
        config.storage.backend,
        config.data_dir.display()
    );

    api::serve(&args.addr(), config).await
}
