// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands, their arguments and the global flags.

use clap::{Parser, Subcommand};
use kiln::buildcontrol::UpdateMode;
use kiln::output::OutputMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Continuous build and deploy for images, Kubernetes, Compose and local commands")]
#[command(version)]
pub struct Cli {
    /// Path to the config file (defaults to kiln.yml in the current directory)
    #[arg(short, long, global = true)]
    pub file: Option<PathBuf>,

    /// How image changes are applied: auto, image, container or exec
    #[arg(long, global = true)]
    pub update_mode: Option<UpdateMode>,

    /// Output format
    #[arg(long, value_enum, global = true, default_value_t = OutputMode::Normal)]
    pub output: OutputMode,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and deploy every manifest, then keep running until interrupted
    Up,

    /// Run the initial builds once and exit non-zero if any fail
    Ci,

    /// List manifests and their targets in build order
    Targets,

    /// Initialize a new kiln.yml configuration file
    Init {
        /// Manifest name
        #[arg(short, long)]
        name: Option<String>,

        /// Image reference
        #[arg(short, long)]
        image: Option<String>,

        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}
