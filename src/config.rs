//! Configuration loading and validation.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server identity and logging.
    #[serde(default)]
    pub server: ServerConfig,
    /// Registry timing knobs.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Bus transport knobs.
    #[serde(default)]
    pub bus: BusConfig,
    /// Profile catalog database. Absent means an in-memory catalog seeded
    /// with the bundled default profile.
    pub database: Option<DatabaseConfig>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Name this core announces as `senderId` on the bus.
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Log output format.
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// Prometheus HTTP port. 0 disables the endpoint (used by tests).
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// Registry timing configuration. All values from the operations handbook;
/// every one is overridable.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Heartbeat monitor tick interval.
    #[serde(default = "default_heartbeat_tick_secs")]
    pub heartbeat_tick_secs: u64,
    /// Missing heartbeats for this long demotes AVAILABLE to UNAVAILABLE.
    #[serde(default = "default_soft_timeout_secs")]
    pub soft_timeout_secs: u64,
    /// Missing heartbeats for this long moves UNAVAILABLE to DEAD.
    #[serde(default = "default_hard_timeout_secs")]
    pub hard_timeout_secs: u64,
    /// How long a freed ID stays reserved before it may be reallocated.
    #[serde(default = "default_recycle_window_secs")]
    pub recycle_window_secs: u64,
    /// Deadline for a backend to answer an evacuation request.
    #[serde(default = "default_evacuation_deadline_secs")]
    pub evacuation_deadline_secs: u64,
    /// Re-registrations from the same address:port inside this window are
    /// deduplicated onto the existing ID.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Rows per page in the operator console tables.
    #[serde(default = "default_console_page_size")]
    pub console_page_size: usize,
    /// How long DEAD entries remain visible in the console.
    #[serde(default = "default_dead_display_secs")]
    pub dead_display_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_tick_secs: default_heartbeat_tick_secs(),
            soft_timeout_secs: default_soft_timeout_secs(),
            hard_timeout_secs: default_hard_timeout_secs(),
            recycle_window_secs: default_recycle_window_secs(),
            evacuation_deadline_secs: default_evacuation_deadline_secs(),
            dedup_window_secs: default_dedup_window_secs(),
            console_page_size: default_console_page_size(),
            dead_display_secs: default_dead_display_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_tick(&self) -> Duration {
        Duration::from_secs(self.heartbeat_tick_secs)
    }

    pub fn soft_timeout_ms(&self) -> u64 {
        self.soft_timeout_secs * 1000
    }

    pub fn hard_timeout_ms(&self) -> u64 {
        self.hard_timeout_secs * 1000
    }

    pub fn recycle_window_ms(&self) -> u64 {
        self.recycle_window_secs * 1000
    }

    pub fn evacuation_deadline_ms(&self) -> u64 {
        self.evacuation_deadline_secs * 1000
    }

    pub fn dedup_window_ms(&self) -> u64 {
        self.dedup_window_secs * 1000
    }

    pub fn dead_display_ms(&self) -> u64 {
        self.dead_display_secs * 1000
    }
}

/// Bus transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Timeout for request/reply exchanges.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite file holding the profile catalog.
    pub path: String,
}

fn default_server_name() -> String {
    "registry-core".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_heartbeat_tick_secs() -> u64 {
    1
}

fn default_soft_timeout_secs() -> u64 {
    15
}

fn default_hard_timeout_secs() -> u64 {
    60
}

fn default_recycle_window_secs() -> u64 {
    300
}

fn default_evacuation_deadline_secs() -> u64 {
    60
}

fn default_dedup_window_secs() -> u64 {
    30
}

fn default_console_page_size() -> usize {
    10
}

fn default_dead_display_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.name is required")]
    MissingServerName,
    #[error("registry.{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("registry.soft_timeout_secs ({0}) must be less than registry.hard_timeout_secs ({1})")]
    SoftNotBelowHard(u64, u64),
    #[error("registry.console_page_size must be greater than zero")]
    ZeroPageSize,
    #[error("bus.request_timeout_secs must be greater than zero")]
    ZeroRequestTimeout,
    #[error("database.path parent directory does not exist: {0}")]
    DatabasePathInvalid(String),
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.name.is_empty() {
        errors.push(ValidationError::MissingServerName);
    }

    let reg = &config.registry;
    for (value, field) in [
        (reg.heartbeat_tick_secs, "heartbeat_tick_secs"),
        (reg.soft_timeout_secs, "soft_timeout_secs"),
        (reg.hard_timeout_secs, "hard_timeout_secs"),
        (reg.recycle_window_secs, "recycle_window_secs"),
        (reg.evacuation_deadline_secs, "evacuation_deadline_secs"),
        (reg.dedup_window_secs, "dedup_window_secs"),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroDuration(field));
        }
    }

    if reg.soft_timeout_secs >= reg.hard_timeout_secs {
        errors.push(ValidationError::SoftNotBelowHard(
            reg.soft_timeout_secs,
            reg.hard_timeout_secs,
        ));
    }

    if reg.console_page_size == 0 {
        errors.push(ValidationError::ZeroPageSize);
    }

    if config.bus.request_timeout_secs == 0 {
        errors.push(ValidationError::ZeroRequestTimeout);
    }

    if let Some(ref db) = config.database {
        let db_path = Path::new(&db.path);
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            errors.push(ValidationError::DatabasePathInvalid(db.path.clone()));
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
