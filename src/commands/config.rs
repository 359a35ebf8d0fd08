use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use tracevault::config::{self, Config};
use tracing::info;

/// Execute the config show command
///
/// Displays the current configuration with secrets masked
pub fn show(config_path: &Path) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!("Loading configuration for display");

    let cfg = config::load_config(&config_path.to_string_lossy())?;
    let sanitized = sanitize_secrets(&cfg);

    println!("{}", "Current Configuration:".green().bold());
    println!();

    // Serialize to TOML format
    let toml_string = toml::to_string_pretty(&sanitized)?;
    println!("{}", toml_string);

    info!("Configuration displayed successfully");
    Ok(())
}

/// Execute the config validate command
///
/// Validates the configuration file
pub fn validate(config_path: &Path) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());
    info!("Validating configuration file");

    let cfg = config::load_config(&config_path.to_string_lossy())?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Listen Address: {}:{}", cfg.server.host, cfg.server.port);
    println!("  Database: {}", cfg.storage.database_url);
    println!(
        "  Notifications: {}",
        if cfg.notify.background_queue {
            "queued"
        } else {
            "inline"
        }
    );
    println!("  Admin Links: {}", cfg.notify.admin_base_url);

    info!("Configuration validation successful");
    Ok(())
}

/// Sanitize secrets in configuration for safe display
///
/// This masks the operator token to show only first 7 and last 4 characters
fn sanitize_secrets(cfg: &Config) -> Config {
    let mut sanitized = cfg.clone();
    sanitized.admin.token = mask_token(&sanitized.admin.token);
    sanitized
}

/// Mask a token for safe display
///
/// Shows first 7 and last 4 characters with an ellipsis in between
/// Example: "apm-operator-secret-0001" -> "apm-ope...0001"
fn mask_token(token: &str) -> String {
    if token.len() <= 11 {
        // Too short to mask meaningfully
        return "***".to_string();
    }

    let prefix = &token[..7];
    let suffix = &token[token.len() - 4..];

    format!("{}...{}", prefix, suffix)
}
