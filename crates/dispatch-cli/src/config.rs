//! Configuration file management for dispatchd.
//!
//! Provides a TOML-based config file at `~/.config/dispatchd/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use dispatch_core::DispatchConfig;
use dispatch_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub server: ServerSection,
    pub dispatch: DispatchSection,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            database: DatabaseSection::default(),
            server: ServerSection::default(),
            dispatch: DispatchSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
    /// `DB_ENABLE`: whether a persistence backend is wired in at all.
    /// Disabled means the loop runs against `NullPersistence` only.
    pub enable: bool,
    /// `DB_CLEAN_DATA`: skip startup recovery and start from an empty tree.
    pub clean_data: bool,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: DbConfig::DEFAULT_URL.to_string(),
            enable: true,
            clean_data: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub address: String,
    pub port: u16,
    pub logdir: String,
    pub pidfile: String,
    /// `POOLS_BACKEND_TYPE`. Only `db` is implemented; kept as a string so
    /// an unrecognized value from an old config file fails loudly at
    /// startup rather than silently falling back.
    pub pools_backend_type: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8004,
            logdir: "/var/log/dispatchd".to_string(),
            pidfile: "/var/run/dispatchd.pid".to_string(),
            pools_backend_type: "db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    pub master_update_interval_secs: u64,
    pub max_retry_cmd_count: u32,
    pub delay_before_autoretry_secs: u64,
    /// Path to the license pool file consulted by the license manager.
    /// Empty means no file-backed licenses (counted reservations only).
    pub file_backend_licences_path: String,
}

impl Default for DispatchSection {
    fn default() -> Self {
        let defaults = DispatchConfig::default();
        Self {
            master_update_interval_secs: defaults.tick_interval.as_secs(),
            max_retry_cmd_count: defaults.max_retry_cmd_count,
            delay_before_autoretry_secs: defaults.delay_before_autoretry.as_secs(),
            file_backend_licences_path: String::new(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the dispatchd config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/dispatchd` or
/// `~/.config/dispatchd`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support` on
/// macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("dispatchd");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("dispatchd")
}

/// Return the path to the dispatchd config file.
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

    // Set permissions to 0600 (owner read/write only) on Unix.
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

/// Fully resolved configuration, ready for `serve`/`db-init` to act on.
#[derive(Debug)]
pub struct DispatcherConfig {
    pub db_config: DbConfig,
    pub db_enable: bool,
    pub db_clean_data: bool,
    pub bind_address: String,
    pub port: u16,
    pub pools_backend_type: String,
    pub file_backend_licences_path: String,
    pub dispatch_config: DispatchConfig,
}

impl DispatcherConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// Only the database URL has a CLI-flag override today; the rest come
    /// from the config file with built-in defaults, matching §6.
    ///
    /// - DB URL: `cli_db_url` > `DISPATCHD_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().unwrap_or_default();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("DISPATCHD_DATABASE_URL") {
            url
        } else {
            file_config.database.url.clone()
        };

        let dispatch_config = DispatchConfig {
            tick_interval: Duration::from_secs(file_config.dispatch.master_update_interval_secs),
            max_retry_cmd_count: file_config.dispatch.max_retry_cmd_count,
            delay_before_autoretry: Duration::from_secs(
                file_config.dispatch.delay_before_autoretry_secs,
            ),
            ..DispatchConfig::default()
        };

        Ok(Self {
            db_config: DbConfig::new(db_url),
            db_enable: file_config.database.enable,
            db_clean_data: file_config.database.clean_data,
            bind_address: file_config.server.address,
            port: file_config.server.port,
            pools_backend_type: file_config.server.pools_backend_type,
            file_backend_licences_path: file_config.dispatch.file_backend_licences_path,
            dispatch_config,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("dispatchd");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
                enable: true,
                clean_data: false,
            },
            server: ServerSection::default(),
            dispatch: DispatchSection::default(),
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.server.port, original.server.port);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();

        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();

        unsafe { std::env::set_var("DISPATCHD_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = DispatcherConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("DISPATCHD_DATABASE_URL") };
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();

        unsafe { std::env::set_var("DISPATCHD_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = DispatcherConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("DISPATCHD_DATABASE_URL") };
    }

    #[test]
    fn resolve_defaults_db_url_when_nothing_set() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("DISPATCHD_DATABASE_URL") };

        let config = DispatcherConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(config.port, 8004);
        assert!(config.db_enable);
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("dispatchd/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
