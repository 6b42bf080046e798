// src/main.rs

//! The main entry point for the PrismCtl controller application.

use anyhow::Result;
use prismctl::config::Config;
use prismctl::core::constants;
use prismctl::core::controller;
use std::env;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();
    if args.contains(&"--version".to_string()) {
        println!("PrismCtl version {VERSION}");
        return Ok(());
    }

    // The config path comes from --config, the environment, or the default
    // file next to the binary, in that order.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| env::var(constants::ENV_CONFIG_FILE_PATH).ok())
        .unwrap_or_else(|| "prismctl.toml".to_string());

    // Setup logging with compact format; RUST_LOG wins over the default.
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,prismctl::core::scheduler=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    // The controller cannot run without a valid configuration.
    let config = match Config::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    info!(version = VERSION, config = %config_path, "Starting PrismCtl controller");
    if let Err(e) = controller::run(config).await {
        error!("Controller runtime error: {e}");
        return Err(e);
    }
    Ok(())
}
