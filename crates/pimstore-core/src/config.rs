use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PimError, Result};

/// Default payload size (in bytes) above which parts are stored as files.
pub const DEFAULT_SIZE_THRESHOLD: i64 = 4096;

/// Relational database engines the store can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    Sqlite,
    Mysql,
    Postgres,
}

impl DbEngine {
    pub const ALL: [DbEngine; 3] = [DbEngine::Sqlite, DbEngine::Mysql, DbEngine::Postgres];

    /// Name used in the configuration file and on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            DbEngine::Sqlite => "sqlite",
            DbEngine::Mysql => "mysql",
            DbEngine::Postgres => "postgres",
        }
    }

    /// Whether the database lives in a single file rather than a data directory.
    pub fn is_file_based(&self) -> bool {
        matches!(self, DbEngine::Sqlite)
    }
}

impl fmt::Display for DbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DbEngine {
    type Err = PimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(DbEngine::Sqlite),
            "mysql" => Ok(DbEngine::Mysql),
            "postgres" => Ok(DbEngine::Postgres),
            _ => Err(PimError::Config(format!(
                "Invalid database engine \"{}\" - valid values are \"sqlite\", \"mysql\" and \"postgres\".",
                s
            ))),
        }
    }
}

/// Server configuration file.
///
/// Holds the active driver in `[general]` and one settings group per
/// database engine, so switching engines never loses the settings of the
/// previous one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default = "DriverSettings::sqlite")]
    pub sqlite: DriverSettings,
    #[serde(default = "DriverSettings::server")]
    pub mysql: DriverSettings,
    #[serde(default = "DriverSettings::server")]
    pub postgres: DriverSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            sqlite: DriverSettings::sqlite(),
            mysql: DriverSettings::server(),
            postgres: DriverSettings::server(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        info!("Server configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing or
    /// broken.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load server config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Server configuration saved to {}", path.display());
        Ok(())
    }

    /// Check the values that cannot be repaired silently.
    pub fn validate(&self) -> Result<()> {
        if self.general.log_level.trim().is_empty() {
            return Err(PimError::Config("general.log_level must not be empty".into()));
        }
        for engine in DbEngine::ALL {
            if engine != DbEngine::Sqlite && self.driver_settings(engine).name.trim().is_empty() {
                return Err(PimError::Config(format!(
                    "{}.name must name a database",
                    engine
                )));
            }
        }
        Ok(())
    }

    /// Payload size threshold in bytes. Negative values are treated as 0.
    pub fn size_threshold(&self) -> u64 {
        self.general.size_threshold.max(0) as u64
    }

    pub fn driver_settings(&self, engine: DbEngine) -> &DriverSettings {
        match engine {
            DbEngine::Sqlite => &self.sqlite,
            DbEngine::Mysql => &self.mysql,
            DbEngine::Postgres => &self.postgres,
        }
    }

    pub fn driver_settings_mut(&mut self, engine: DbEngine) -> &mut DriverSettings {
        match engine {
            DbEngine::Sqlite => &mut self.sqlite,
            DbEngine::Mysql => &mut self.mysql,
            DbEngine::Postgres => &mut self.postgres,
        }
    }
}

/// `[general]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Active database engine.
    pub driver: DbEngine,
    /// Parts larger than this many bytes are stored as external files.
    pub size_threshold: i64,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            driver: DbEngine::Sqlite,
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            log_level: "info".to_string(),
        }
    }
}

/// Per-engine connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverSettings {
    /// Database name, or the database file path for SQLite. Empty selects
    /// the default location.
    pub name: String,
    pub host: String,
    pub user: String,
    pub password: String,
    /// Driver specific connection options.
    pub options: String,
    /// Path of the server binary used when the server is started internally.
    pub server_path: String,
    /// Start and stop a private database server together with the store.
    pub start_server: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::sqlite()
    }
}

impl DriverSettings {
    fn sqlite() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            user: String::new(),
            password: String::new(),
            options: String::new(),
            server_path: String::new(),
            start_server: false,
        }
    }

    fn server() -> Self {
        Self {
            name: "pimstore".to_string(),
            start_server: true,
            ..Self::sqlite()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.general.driver, DbEngine::Sqlite);
        assert_eq!(config.general.size_threshold, 4096);
        assert_eq!(config.size_threshold(), 4096);
        assert!(config.sqlite.name.is_empty());
    }

    #[test]
    fn test_parse_engine_names() {
        assert_eq!("sqlite".parse::<DbEngine>().unwrap(), DbEngine::Sqlite);
        assert_eq!("MySQL".parse::<DbEngine>().unwrap(), DbEngine::Mysql);
        assert_eq!("postgres".parse::<DbEngine>().unwrap(), DbEngine::Postgres);

        let err = "oracle".parse::<DbEngine>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid database engine \"oracle\" - valid values are \"sqlite\", \"mysql\" and \"postgres\"."
        );
    }

    #[test]
    fn test_negative_threshold_clamps_to_zero() {
        let mut config = ServerConfig::default();
        config.general.size_threshold = -10;
        assert_eq!(config.size_threshold(), 0);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
[general]
driver = "postgres"

[postgres]
name = "pim"
host = "/run/pimstore"
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.driver, DbEngine::Postgres);
        assert_eq!(config.general.size_threshold, 4096);
        assert_eq!(config.postgres.name, "pim");
        assert_eq!(config.postgres.host, "/run/pimstore");
        assert_eq!(config.mysql.name, "pimstore");
        assert!(config.mysql.start_server);
        assert!(!config.sqlite.start_server);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.toml");

        let mut config = ServerConfig::default();
        config.general.driver = DbEngine::Mysql;
        config.mysql.options = "UNIX_SOCKET=/tmp/mysql.socket".to_string();
        config.save(&path).unwrap();

        let reloaded = ServerConfig::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load_or_default(&dir.path().join("absent.toml"));
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_invalid_driver_in_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "[general]\ndriver = \"oracle\"\n").unwrap();
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(matches!(err, PimError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_empty_server_database_name() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());
        config.driver_settings_mut(DbEngine::Mysql).name.clear();
        assert!(config.validate().is_err());
    }
}
