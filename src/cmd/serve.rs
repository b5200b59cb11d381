//! Board server command: `teamspace serve`.

use anyhow::Result;
use tracing::warn;

use teamspace::board::server::{ServerConfig, start_server};
use teamspace::config::AppConfig;

pub async fn cmd_serve(config: &AppConfig) -> Result<()> {
    for warning in config.validate() {
        warn!("{}", warning);
    }
    start_server(ServerConfig::from(config)).await
}
