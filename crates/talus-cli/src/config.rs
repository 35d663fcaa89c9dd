//! Configuration file management for talus.
//!
//! Provides a TOML-based config file at `~/.config/talus/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use talus_core::broker::BrokerConfig;
use talus_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub broker: BrokerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BrokerSection {
    pub redis_url: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the talus config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/talus` or `~/.config/talus`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("talus");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("talus")
}

/// Return the path to the talus config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct TalusConfig {
    pub db_config: DbConfig,
    pub broker_config: BrokerConfig,
}

impl TalusConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `TALUS_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Redis URL: `cli_redis_url` > `TALUS_REDIS_URL` env > `config_file.broker.redis_url` > `BrokerConfig::DEFAULT_REDIS_URL`
    ///
    /// The remaining broker knobs (lease TTL, heartbeat interval, retry
    /// budget, backoff, janitor tick) are not part of the config file;
    /// they come from [`BrokerConfig::from_env`]'s built-in defaults.
    pub fn resolve(cli_db_url: Option<&str>, cli_redis_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("TALUS_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let redis_url = if let Some(url) = cli_redis_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("TALUS_REDIS_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.broker.redis_url.clone()
        } else {
            BrokerConfig::DEFAULT_REDIS_URL.to_string()
        };

        let mut broker_config = BrokerConfig::from_env();
        broker_config.redis_url = redis_url;

        Ok(Self { db_config, broker_config })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
