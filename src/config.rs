//! Layered configuration for teamspace.
//!
//! Settings are resolved in order, later layers winning:
//! 1. `teamspace.toml` (working directory, then the user config dir)
//! 2. `TEAMSPACE_*` environment variables (a `.env` file is loaded first)
//! 3. CLI flags
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = "teamspace.db"
//! cors_permissive = false
//!
//! [logging]
//! level = "info"
//! json = false
//! # dir = "logs"
//!
//! [chat]
//! max_message_len = 1000
//!
//! [polling]
//! messages_ms = 1000
//! conversations_ms = 5000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name looked up in the working directory and the user config dir.
pub const CONFIG_FILE: &str = "teamspace.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TEAMSPACE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Allow any origin. Meant for a local front-end dev server.
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from("teamspace.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset, e.g. `info` or `teamspace=debug`.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rotated log files. Stderr only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSection {
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

fn default_max_message_len() -> usize {
    crate::board::chat::MAX_MESSAGE_LEN
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            max_message_len: default_max_message_len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingSection {
    #[serde(default = "default_messages_ms")]
    pub messages_ms: u64,
    #[serde(default = "default_conversations_ms")]
    pub conversations_ms: u64,
}

fn default_messages_ms() -> u64 {
    1000
}

fn default_conversations_ms() -> u64 {
    5000
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            messages_ms: default_messages_ms(),
            conversations_ms: default_conversations_ms(),
        }
    }
}

/// The complete teamspace.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub chat: ChatSection,
    #[serde(default)]
    pub polling: PollingSection,
}

/// Flags that override file and environment settings.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}{}: {}", ENV_PREFIX, key, e))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("Invalid value for {}{}: '{}'", ENV_PREFIX, key, other),
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse teamspace.toml")
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize teamspace.toml")
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `TEAMSPACE_*` overrides read through `lookup`.
    ///
    /// `lookup` receives the unprefixed key, e.g. `PORT` for `TEAMSPACE_PORT`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.server.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = lookup("DB_PATH") {
            self.server.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CORS_PERMISSIVE") {
            self.server.cors_permissive = parse_bool("CORS_PERMISSIVE", &v)?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("LOG_JSON") {
            self.logging.json = parse_bool("LOG_JSON", &v)?;
        }
        if let Some(v) = lookup("LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v)).filter(|p| !p.as_os_str().is_empty());
        }
        if let Some(v) = lookup("MAX_MESSAGE_LEN") {
            self.chat.max_message_len = parse_env("MAX_MESSAGE_LEN", &v)?;
        }
        if let Some(v) = lookup("POLL_MESSAGES_MS") {
            self.polling.messages_ms = parse_env("POLL_MESSAGES_MS", &v)?;
        }
        if let Some(v) = lookup("POLL_CONVERSATIONS_MS") {
            self.polling.conversations_ms = parse_env("POLL_CONVERSATIONS_MS", &v)?;
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(path) = &cli.db_path {
            self.server.db_path = path.clone();
        }
        if cli.dev {
            self.server.cors_permissive = true;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.server.port == 0 {
            warnings.push("server.port is 0; an ephemeral port will be chosen".to_string());
        }
        if self.chat.max_message_len == 0 {
            warnings.push("chat.max_message_len is 0; every message will be rejected".to_string());
        }
        if self.polling.messages_ms == 0 || self.polling.conversations_ms == 0 {
            warnings.push("polling intervals must be greater than 0".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!(
                "Invalid logging.level '{}': expected a tracing filter such as 'info'",
                self.logging.level
            ));
        }
        warnings
    }
}

/// Where the config file is read from: an explicit path, `./teamspace.toml`,
/// or `<config dir>/teamspace/teamspace.toml`.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("teamspace").join(CONFIG_FILE))
        .filter(|p| p.exists())
        .unwrap_or(local)
}

/// Resolve the effective configuration from every layer.
pub fn resolve(explicit: Option<&Path>, cli: &CliOverrides) -> Result<AppConfig> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let path = config_path(explicit);
    let mut config = if explicit.is_some() {
        AppConfig::load(&path)?
    } else {
        AppConfig::load_or_default(&path)?
    };
    config.apply_process_env()?;
    config.apply_cli(cli);
    Ok(config)
}
