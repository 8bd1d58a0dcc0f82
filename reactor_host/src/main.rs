//! Main entry point for the reactor host CLI.

use anyhow::Result;
use clap::Parser;
use reactor_host::{cli, plugin::ExtensionTable, settings::Settings, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let mut settings = Settings::load()?;
    args.apply(&mut settings);

    // Initialize telemetry
    telemetry::init(&settings.logging)?;

    // Execute the requested command
    match args.command {
        cli::Commands::Serve => cli::serve(settings, ExtensionTable::new()).await,
        cli::Commands::Plugins => {
            cli::list_plugins(&settings);
            Ok(())
        }
        cli::Commands::Deps => {
            cli::print_dependencies(&settings);
            Ok(())
        }
    }
}
