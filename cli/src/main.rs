use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod workspace;

use commands::*;
use config::WorkspaceConfig;

#[derive(Parser)]
#[command(name = "sprout")]
#[command(about = "Workspace engine for source-based package graphs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workspace root directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve dependencies, reconcile checkouts, and produce the module graph
    Resolve,

    /// Re-resolve to the newest allowed versions, dropping stray pins
    Update {
        /// Preview the version motions without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Put a dependency into edit mode (a writable sibling checkout)
    Edit {
        /// Package identity to edit
        package: String,
        /// Use an existing directory instead of a managed checkout
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Restore a dependency from edit mode to its recorded checkout
    Unedit {
        /// Package identity to restore
        package: String,
        /// Discard uncommitted changes in the edit directory
        #[arg(long)]
        force: bool,
    },

    /// Drop pins, managed state, and all sandbox checkouts
    Reset,

    /// Remove extracted prebuilts and binary artifacts
    Clean,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let mut config = WorkspaceConfig::load(&root)?;
    if cli.verbose {
        config.verbose = Some(true);
    }

    match cli.command {
        Commands::Resolve => resolve_command(root, config).await,
        Commands::Update { dry_run } => update_command(root, config, dry_run).await,
        Commands::Edit { package, path } => edit_command(root, config, &package, path).await,
        Commands::Unedit { package, force } => {
            unedit_command(root, config, &package, force).await
        }
        Commands::Reset => reset_command(root, config).await,
        Commands::Clean => clean_command(root, config).await,
    }
}
