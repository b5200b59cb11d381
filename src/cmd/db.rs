//! Database setup command: `teamspace init-db`.

use anyhow::{Context, Result};

use teamspace::board::db::BoardDb;
use teamspace::config::AppConfig;

pub fn cmd_init_db(config: &AppConfig) -> Result<()> {
    let db_path = &config.server.db_path;
    BoardDb::new(db_path)
        .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;
    println!("Database initialized at {}", db_path.display());
    Ok(())
}
