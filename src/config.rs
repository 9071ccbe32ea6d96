//! Configuration management for custocrypt

use crate::accel::BackendKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default PBKDF2-HMAC-SHA256 iteration count for passphrase keys
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 1_000_000;

/// Default per-chunk task timeout (seconds)
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Default total wait for a device approval (seconds)
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 60;

/// Default approval polling interval (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Custodian endpoint paths, relative to `base_url`
///
/// `{session_id}` and `{user_id}` placeholders are filled per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub health: String,
    pub register_session: String,
    pub check_approval: String,
    pub encryption_completed: String,
    pub get_key: String,
    pub decrypt_key: String,
    pub get_public_key: String,
    pub websocket: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            health: "/health".to_string(),
            register_session: "/api/session/register".to_string(),
            check_approval: "/api/session/check/{session_id}".to_string(),
            encryption_completed: "/api/encryption/completed".to_string(),
            get_key: "/api/key/get".to_string(),
            decrypt_key: "/api/key/decrypt/{user_id}".to_string(),
            get_public_key: "/api/key/public/{user_id}".to_string(),
            websocket: "/ws".to_string(),
        }
    }
}

/// Key custodian server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the custodian HTTP API
    pub base_url: String,

    /// Push channel URL
    pub ws_url: String,

    /// Endpoint paths
    #[serde(default)]
    pub endpoints: EndpointConfig,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Retry attempts for idempotent requests
    pub retry_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub retry_base_delay_ms: u64,

    /// Push channel heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,

    /// User whose custodian key pair protects our files
    pub user_id: String,

    /// Identifier sent with heartbeats
    pub client_id: String,
}

/// How the REMOTE_READY path obtains a symmetric key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeySourceMode {
    /// Generate locally (random or passphrase-derived)
    #[default]
    Local,
    /// Ask the custodian to issue one via the key endpoint
    Custodian,
}

/// Digest used inside RSA-OAEP
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OaepHash {
    #[default]
    Sha1,
    Sha256,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// PBKDF2 iterations for passphrase-derived keys
    pub pbkdf2_iterations: u32,

    /// OAEP digest
    #[serde(default)]
    pub oaep_hash: OaepHash,

    /// Worker count (None = available parallelism)
    pub max_workers: Option<usize>,

    /// Per-chunk timeout in seconds
    pub task_timeout_secs: u64,

    /// Where keys come from on the remote path
    #[serde(default)]
    pub key_source: KeySourceMode,
}

/// Device approval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Require a secondary-device approval before encrypting
    pub required: bool,

    /// Total wait in seconds
    pub timeout_secs: u64,

    /// Polling interval in seconds
    pub poll_interval_secs: u64,
}

/// Acceleration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccelerationConfig {
    /// Preferred backend
    pub preferred: BackendKind,

    /// Directory holding `cuda/` and `opencl/` accelerator libraries
    pub library_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
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
    /// Custodian server configuration
    pub server: ServerConfig,

    /// Encryption configuration
    pub encryption: EncryptionConfig,

    /// Approval configuration
    pub approval: ApprovalConfig,

    /// Acceleration configuration
    pub acceleration: AccelerationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the data directory (session cache)
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let client_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "pc_client".to_string());

        ServerConfig {
            base_url: "http://localhost:8000".to_string(),
            ws_url: "ws://localhost:8000/ws".to_string(),
            endpoints: EndpointConfig::default(),
            timeout_secs: 5,
            retry_attempts: 3,
            retry_base_delay_ms: 250,
            heartbeat_interval_secs: 30,
            user_id: "default_user".to_string(),
            client_id,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            oaep_hash: OaepHash::Sha1,
            max_workers: None,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            key_source: KeySourceMode::Local,
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        ApprovalConfig {
            required: false,
            timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl Default for AccelerationConfig {
    fn default() -> Self {
        AccelerationConfig {
            preferred: BackendKind::Software,
            library_dir: PathBuf::from("accel_libs"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("custocrypt");

        Config {
            server: ServerConfig::default(),
            encryption: EncryptionConfig::default(),
            approval: ApprovalConfig::default(),
            acceleration: AccelerationConfig::default(),
            logging: LoggingConfig::default(),
            data_dir,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl EncryptionConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Resolve the worker count
    pub fn workers(&self) -> usize {
        self.max_workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment variable
    /// substitution and overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let content = Self::substitute_env_vars(&content);

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content).map_err(|e| {
                Error::Config(format!("Failed to parse YAML config: {}", e))
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                Error::Config(format!("Failed to parse JSON config: {}", e))
            })?
        };

        if config.data_dir == PathBuf::new() {
            config.data_dir = Config::default().data_dir;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CUSTOCRYPT_SERVER_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if !url.is_empty() {
                self.server.base_url = url;
            }
        }

        if let Ok(user) = std::env::var("CUSTOCRYPT_USER_ID") {
            let user = user.trim().to_string();
            if !user.is_empty() {
                self.server.user_id = user;
            }
        }

        if let Ok(workers) = std::env::var("CUSTOCRYPT_MAX_WORKERS") {
            if let Ok(n) = workers.trim().parse::<usize>() {
                self.encryption.max_workers = Some(n);
            }
        }

        if let Ok(backend) = std::env::var("CUSTOCRYPT_BACKEND") {
            if let Ok(kind) = backend.trim().parse::<BackendKind>() {
                self.acceleration.preferred = kind;
            }
        }
    }

    /// Substitute environment variables in config content
    /// Supports ${VAR_NAME} syntax
    fn substitute_env_vars(content: &str) -> String {
        let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex is valid");

        re.replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
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

        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path_ref, content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.base_url.is_empty() {
            return Err(Error::InvalidConfig("server.base_url is required".to_string()));
        }

        if self.server.user_id.is_empty() {
            return Err(Error::InvalidConfig("server.user_id is required".to_string()));
        }

        if self.server.timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "server.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.encryption.pbkdf2_iterations == 0 {
            return Err(Error::InvalidConfig(
                "encryption.pbkdf2_iterations must be greater than 0".to_string(),
            ));
        }

        if self.encryption.task_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "encryption.task_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.approval.poll_interval_secs == 0
            || self.approval.poll_interval_secs > self.approval.timeout_secs
        {
            return Err(Error::InvalidConfig(
                "approval.poll_interval_secs must be in 1..=timeout_secs".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// Path of the persisted session file
    pub fn session_file(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.approval.timeout_secs, 60);
        assert_eq!(config.approval.poll_interval_secs, 2);
        assert_eq!(config.acceleration.preferred, BackendKind::Software);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.server.user_id = "alice".to_string();
        config.encryption.key_source = KeySourceMode::Custodian;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.user_id, "alice");
        assert_eq!(loaded.encryption.key_source, KeySourceMode::Custodian);
        assert_eq!(loaded.server.endpoints, EndpointConfig::default());
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.acceleration.preferred = BackendKind::OpenClGpu;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.acceleration.preferred, BackendKind::OpenClGpu);
    }

    #[test]
    fn test_env_substitution_leaves_unknown_vars() {
        std::env::set_var("CUSTOCRYPT_TEST_HOST", "custodian.internal");
        let out = Config::substitute_env_vars(
            "url: https://${CUSTOCRYPT_TEST_HOST}/ and ${CUSTOCRYPT_SURELY_UNSET_VAR}",
        );
        assert_eq!(
            out,
            "url: https://custodian.internal/ and ${CUSTOCRYPT_SURELY_UNSET_VAR}"
        );
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(config.encryption.task_timeout_secs, DEFAULT_TASK_TIMEOUT_SECS);
    }
}
