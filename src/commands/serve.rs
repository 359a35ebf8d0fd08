use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use tracevault::{config, init_tracing, server};
use tracing::info;

/// Execute the serve command
///
/// This will:
/// 1. Load configuration
/// 2. Initialize tracing with the configured log level as the default filter
/// 3. Start the server (blocks until shutdown)
pub async fn execute(config_path: &Path) -> Result<()> {
    println!("{}", "Starting tracevault...".green());

    let cfg = config::load_config(&config_path.to_string_lossy())?;

    // RUST_LOG still wins when set
    init_tracing(&cfg.server.log_level);

    info!(config = %config_path.display(), "Configuration loaded");

    server::start_server(cfg).await?;

    Ok(())
}
