// ABOUTME: Entry point for the kiln CLI application.
// ABOUTME: Parses arguments, sets up logging and dispatches to command handlers.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use commands::Project;
use kiln::config;
use kiln::error::Result;
use kiln::output::Output;
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbose flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn,kiln=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let output = Output::new(cli.output);
    if let Err(e) = run(cli).await {
        output.error(&e.to_string());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { name, image, force } => {
            let cwd = env::current_dir()?;
            config::init_config(&cwd, name.as_deref(), image.as_deref(), force)?;
            Output::new(cli.output).success(&format!("Created {}", config::CONFIG_FILENAME));
            Ok(())
        }
        Commands::Up => {
            let project = Project::load(cli.file.as_deref())?;
            commands::up(project, cli.update_mode, cli.output).await
        }
        Commands::Ci => {
            let project = Project::load(cli.file.as_deref())?;
            commands::ci(project, cli.update_mode, cli.output).await
        }
        Commands::Targets => {
            let project = Project::load(cli.file.as_deref())?;
            commands::targets(project, cli.output)
        }
    }
}
