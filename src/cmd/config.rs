//! Configuration view and validation commands: `teamspace config`.

use std::path::Path;

use anyhow::Result;

use super::super::ConfigCommands;
use teamspace::config::{AppConfig, CliOverrides, config_path, resolve};

pub fn cmd_config(explicit: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    let path = config_path(explicit);

    match command {
        None | Some(ConfigCommands::Show) => {
            if path.exists() {
                println!("# Config file: {}", path.display());
            } else {
                println!("# No config file at {}; using defaults", path.display());
            }
            println!("# Effective values (with env overrides):");
            println!();
            let config = resolve(explicit, &CliOverrides::default())?;
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let config = resolve(explicit, &CliOverrides::default())?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if path.exists() && !force {
                println!("{} already exists.", path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            AppConfig::default().save(&path)?;
            println!("Created {}", path.display());
        }
    }

    Ok(())
}
