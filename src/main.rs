use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use tracevault::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = cli::Cli::parse();

    // For serve, tracing is initialized after the config loads so that
    // server.log_level can act as the default filter
    let is_serve = matches!(args.get_command(), cli::Commands::Serve);

    if !is_serve {
        init_tracing("info");
    }

    // Dispatch to appropriate command handler
    match args.get_command() {
        cli::Commands::Serve => {
            commands::serve::execute(&args.config).await?;
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&args.config)?,
            cli::ConfigCommands::Validate => commands::config::validate(&args.config)?,
        },
        cli::Commands::Version => {
            println!("tracevault v{}", env!("CARGO_PKG_VERSION"));
            println!("Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
    }

    Ok(())
}
