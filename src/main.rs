use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use teamspace::config::{CliOverrides, resolve};

mod cmd;

#[derive(Parser)]
#[command(name = "teamspace")]
#[command(version, about = "Team workspaces, tasks and chat over a JSON API")]
pub struct Cli {
    /// Path to teamspace.toml (defaults to ./teamspace.toml)
    #[arg(short, long, global = true, env = "TEAMSPACE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a local front-end dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and its schema without starting the server
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default teamspace.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            let overrides = CliOverrides { port, db_path, dev };
            let mut config = resolve(cli.config.as_deref(), &overrides)?;
            if cli.verbose {
                config.logging.level = "debug".to_string();
            }
            let _guard = teamspace::logging::init(&config.logging)?;
            cmd::cmd_serve(&config).await?;
        }
        Commands::InitDb { db_path } => {
            let overrides = CliOverrides {
                db_path,
                ..Default::default()
            };
            let config = resolve(cli.config.as_deref(), &overrides)?;
            cmd::cmd_init_db(&config)?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(cli.config.as_deref(), command)?;
        }
    }

    Ok(())
}
