//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/sqlport/config.toml)
//! 3. Environment variables (SQLPORT_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable prefix
const ENV_PREFIX: &str = "SQLPORT";

/// Database file opened by `Store::init` when none is configured
pub const DEFAULT_DATABASE: &str = "data.db";

/// Where the engine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Engine threads inside the calling process
    #[default]
    InProcess,
    /// Engine behind the command transport on an isolated worker thread
    Worker,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::InProcess => write!(f, "in-process"),
            BackendKind::Worker => write!(f, "worker"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "in-process" | "inprocess" | "local" => Ok(BackendKind::InProcess),
            "worker" => Ok(BackendKind::Worker),
            other => bail!(
                "Unknown backend '{}'. Use 'in-process' or 'worker'.",
                other
            ),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the databases; relative database paths resolve here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Primary database, relative to `data_dir`
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Engine placement
    #[serde(default)]
    pub backend: BackendKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: default_database(),
            backend: BackendKind::default(),
        }
    }
}

impl Config {
    /// Configuration rooted at a specific data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SQLPORT_DATA_DIR, SQLPORT_DATABASE, SQLPORT_BACKEND)
    /// 2. Config file (~/.config/sqlport/config.toml or SQLPORT_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // SQLPORT_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // SQLPORT_DATABASE
        if let Ok(val) = std::env::var(format!("{}_DATABASE", ENV_PREFIX)) {
            self.database = if val.is_empty() {
                default_database()
            } else {
                PathBuf::from(val)
            };
        }

        // SQLPORT_BACKEND
        if let Ok(val) = std::env::var(format!("{}_BACKEND", ENV_PREFIX)) {
            match val.parse() {
                Ok(kind) => self.backend = kind,
                Err(e) => warn!("Ignoring {}_BACKEND: {}", ENV_PREFIX, e),
            }
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Set a value by key, as the command line does
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "database" => {
                self.database = if value.is_empty() || value == "none" {
                    default_database()
                } else {
                    PathBuf::from(value)
                };
            }
            "backend" => self.backend = value.parse()?,
            _ => bail!(
                "Unknown configuration key: '{}'\nValid keys: data_dir, database, backend",
                key
            ),
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with SQLPORT_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sqlport")
            .join("config.toml")
    }

    /// Get the path to the primary database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sqlport")
}

fn default_database() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            // Clear all the vars
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "SQLPORT_DATA_DIR",
        "SQLPORT_DATABASE",
        "SQLPORT_BACKEND",
        "SQLPORT_CONFIG",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend, BackendKind::InProcess);
        assert_eq!(config.database, PathBuf::from("data.db"));
        assert!(config.data_dir.ends_with("sqlport"));
    }

    #[test]
    fn test_database_path() {
        let config = Config::with_data_dir("/srv/app");
        assert_eq!(config.database_path(), PathBuf::from("/srv/app/data.db"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("SQLPORT_DATA_DIR", "/tmp/sqlport-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/sqlport-test"));
    }

    #[test]
    fn test_env_override_backend() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("SQLPORT_BACKEND", "worker");
        config.apply_env_overrides();
        assert_eq!(config.backend, BackendKind::Worker);

        // Invalid values keep the current setting
        env::set_var("SQLPORT_BACKEND", "remote");
        config.apply_env_overrides();
        assert_eq!(config.backend, BackendKind::Worker);
    }

    #[test]
    fn test_env_override_database() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("SQLPORT_DATABASE", "other.db");
        config.apply_env_overrides();
        assert_eq!(config.database, PathBuf::from("other.db"));

        // Empty string restores the default
        env::set_var("SQLPORT_DATABASE", "");
        config.apply_env_overrides();
        assert_eq!(config.database, PathBuf::from(DEFAULT_DATABASE));
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("worker".parse::<BackendKind>().unwrap(), BackendKind::Worker);
        assert_eq!(
            "In-Process".parse::<BackendKind>().unwrap(),
            BackendKind::InProcess
        );
        assert!("remote".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Worker.to_string(), "worker");
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/sqlport"),
            database: PathBuf::from("main.db"),
            backend: BackendKind::Worker,
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("backend = \"worker\""));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.database, config.database);
        assert_eq!(parsed.backend, config.backend);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            backend = "in-process"
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.database, PathBuf::from(DEFAULT_DATABASE));
        assert_eq!(config.backend, BackendKind::InProcess);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = TempDir::new().unwrap();
        env::set_var("SQLPORT_DATA_DIR", dir.path().join("data"));

        let path = dir.path().join("missing.toml");
        let config = Config::load_from_path(&path).unwrap();
        // Should return defaults when file doesn't exist
        assert_eq!(config.backend, BackendKind::InProcess);
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_set_and_save() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::with_data_dir(dir.path());
        config.set("backend", "worker").unwrap();
        config.set("database", "app.db").unwrap();
        assert!(config.set("sync_url", "x").is_err());
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.backend, BackendKind::Worker);
        assert_eq!(loaded.database, PathBuf::from("app.db"));
    }
}
