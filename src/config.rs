//! Configuration management for quics

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default sled page cache: 64MB
pub const DEFAULT_CACHE_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default number of keys removed per cascade transaction
pub const DEFAULT_CASCADE_BATCH: usize = 4096;

/// Default REST port handed to the transport
pub const DEFAULT_REST_PORT: u16 = 6120;

/// Default HTTP/3 port handed to the transport
pub const DEFAULT_HTTP3_PORT: u16 = 6121;

/// Default length of a generated root password
pub const DEFAULT_GENERATED_PASSWORD_LEN: usize = 16;

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database directory (relative paths resolve against `data_dir`)
    pub path: PathBuf,

    /// Sled page cache capacity in bytes
    pub cache_capacity: u64,

    /// Background flush interval in milliseconds (None = flush on every commit)
    pub flush_every_ms: Option<u64>,

    /// Use a temporary database that is removed on drop
    #[serde(default)]
    pub temporary: bool,

    /// Maximum keys removed in one cascade transaction
    #[serde(default = "default_cascade_batch")]
    pub cascade_batch: usize,
}

fn default_cascade_batch() -> usize {
    DEFAULT_CASCADE_BATCH
}

/// Addresses passed to the external transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub address: String,

    /// REST (HTTP/1.1) port
    pub port: u16,

    /// HTTP/3 port
    pub port3: u16,
}

/// Password hashing and reset policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Secret restored by a password reset; a random one is generated when unset
    #[serde(default)]
    pub default_password: Option<String>,

    /// Length of generated passwords
    #[serde(default = "default_generated_len")]
    pub generated_password_len: usize,
}

fn default_generated_len() -> usize {
    DEFAULT_GENERATED_PASSWORD_LEN
}

/// Retry policy for conflicting commits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts after the first failure
    pub max_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub base_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or EnvFilter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Append log output to this file instead of stdout
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    pub storage: StorageConfig,

    /// Transport addresses
    pub server: ServerConfig,

    /// Password policy
    pub security: SecurityConfig,

    /// Conflict retry policy
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the data directory
    #[serde(default)]
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            security: SecurityConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: PathBuf::from("db"),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            flush_every_ms: Some(500),
            temporary: false,
            cascade_batch: DEFAULT_CASCADE_BATCH,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_REST_PORT,
            port3: DEFAULT_HTTP3_PORT,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            argon2_memory_kib: 19456, // 19 MiB
            argon2_iterations: 2,
            argon2_parallelism: 1,
            default_password: None,
            generated_password_len: DEFAULT_GENERATED_PASSWORD_LEN,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            base_delay_ms: 10,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quics")
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let content = Self::substitute_env_vars(&content);

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        if config.data_dir == PathBuf::new() {
            config.data_dir = default_data_dir();
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    /// Configuration for tests: temporary store, cheap hashing, no backoff
    pub fn for_testing() -> Self {
        Config {
            storage: StorageConfig {
                temporary: true,
                flush_every_ms: None,
                ..StorageConfig::default()
            },
            security: SecurityConfig {
                argon2_memory_kib: 1024,
                argon2_iterations: 1,
                argon2_parallelism: 1,
                ..SecurityConfig::default()
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 0,
            },
            data_dir: std::env::temp_dir().join("quics-test"),
            ..Config::default()
        }
    }

    /// Substitute environment variables in config content
    /// Supports ${VAR_NAME} syntax
    fn substitute_env_vars(content: &str) -> String {
        let mut result = content.to_string();

        let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
            Ok(re) => re,
            Err(_) => return result,
        };

        for cap in re.captures_iter(content) {
            let full_match = &cap[0];
            let var_name = &cap[1];

            if let Ok(value) = std::env::var(var_name) {
                result = result.replace(full_match, &value);
            }
        }

        result
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("QUICS_DATA_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(addr) = std::env::var("QUICS_ADDR") {
            let addr = addr.trim().to_string();
            if !addr.is_empty() {
                self.server.address = addr;
            }
        }

        if let Ok(port) = std::env::var("QUICS_PORT") {
            if let Ok(port) = port.trim().parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(port3) = std::env::var("QUICS_PORT3") {
            if let Ok(port3) = port3.trim().parse::<u16>() {
                self.server.port3 = port3;
            }
        }

        if let Ok(level) = std::env::var("QUICS_LOG") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to YAML: {}", e))
            })?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to JSON: {}", e))
            })?
        };

        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.cascade_batch == 0 {
            return Err(Error::InvalidConfig(
                "storage.cascade_batch must be greater than 0".to_string(),
            ));
        }

        if self.security.argon2_iterations == 0 || self.security.argon2_parallelism == 0 {
            return Err(Error::InvalidConfig(
                "argon2 iterations and parallelism must be greater than 0".to_string(),
            ));
        }

        // argon2 requires at least 8 KiB per lane
        if self.security.argon2_memory_kib < 8 * self.security.argon2_parallelism {
            return Err(Error::InvalidConfig(format!(
                "argon2 memory must be at least {} KiB",
                8 * self.security.argon2_parallelism
            )));
        }

        if let Some(pw) = &self.security.default_password {
            if pw.is_empty() {
                return Err(Error::InvalidConfig(
                    "security.default_password must not be empty".to_string(),
                ));
            }
        }

        if self.security.generated_password_len < 8 {
            return Err(Error::InvalidConfig(
                "security.generated_password_len must be at least 8".to_string(),
            ));
        }

        if self.server.address.is_empty() {
            return Err(Error::InvalidConfig(
                "server.address is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolved database directory
    pub fn database_path(&self) -> PathBuf {
        if self.storage.path.is_absolute() {
            self.storage.path.clone()
        } else {
            self.data_dir.join(&self.storage.path)
        }
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if !self.storage.temporary {
            std::fs::create_dir_all(self.database_path())?;
        }
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}
