//! Configuration for Phoenix.
//!
//! Everything is resolved from environment variables (a `.env` file is
//! loaded first when present). Durations are plain seconds in `*_SECS`
//! variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Main configuration for the control plane.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub analyzer: AnalyzerConfig,
    pub engine: EngineConfig,
    pub hub: HubConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            queue: QueueConfig::from_env()?,
            dispatch: DispatchConfig::from_env()?,
            analyzer: AnalyzerConfig::from_env()?,
            engine: EngineConfig::from_env()?,
            hub: HubConfig::from_env()?,
            metrics: MetricsConfig::from_env()?,
        })
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for the combined agent + client + ws surface.
    pub listen: SocketAddr,
    /// Shared bearer token agents must present. `None` disables the check
    /// (host-id header is still required).
    pub agent_token: Option<SecretString>,
    /// "text" or "json" log output.
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("invalid LOG_FORMAT '{s}', expected 'text' or 'json'")),
        }
    }
}

impl ServerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let listen = optional_env("PHOENIX_LISTEN")?
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "PHOENIX_LISTEN".to_string(),
                message: format!("{e}"),
            })?;

        let agent_token = optional_env("PHOENIX_AGENT_TOKEN")?.map(SecretString::from);

        let log_format = if let Some(s) = optional_env("LOG_FORMAT")? {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: "LOG_FORMAT".to_string(),
                message: e,
            })?
        } else {
            LogFormat::default()
        };

        Ok(Self {
            listen,
            agent_token,
            log_format,
        })
    }

    pub fn agent_token(&self) -> Option<&str> {
        self.agent_token.as_ref().map(|t| t.expose_secret())
    }
}

/// Which store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// PostgreSQL via deadpool-postgres (default).
    #[default]
    Postgres,
    /// Ephemeral in-memory store for development and tests.
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            _ => Err(format!(
                "invalid store backend '{s}', expected 'postgres' or 'memory'"
            )),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: SecretString,
    pub pool_size: usize,
    /// Per-statement timeout applied to every pooled connection.
    pub statement_timeout: Duration,
}

impl DatabaseConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let backend: StoreBackend = if let Some(b) = optional_env("PHOENIX_STORE")? {
            b.parse().map_err(|e| ConfigError::InvalidValue {
                key: "PHOENIX_STORE".to_string(),
                message: e,
            })?
        } else {
            StoreBackend::default()
        };

        // The URL is only required for the postgres backend.
        let url = optional_env("DATABASE_URL")?
            .or_else(|| {
                if backend == StoreBackend::Memory {
                    Some("unused://memory".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "DATABASE_URL".to_string(),
                hint: "Set DATABASE_URL or PHOENIX_STORE=memory".to_string(),
            })?;

        Ok(Self {
            backend,
            url: SecretString::from(url),
            pool_size: parse_optional_env("DATABASE_POOL_SIZE", 25)?,
            statement_timeout: secs_env("STATEMENT_TIMEOUT_SECS", 30)?,
        })
    }

    /// Get the database URL (exposes the secret).
    pub fn url(&self) -> &str {
        self.url.expose_secret()
    }
}

/// Task queue behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub lease_duration: Duration,
    pub max_attempts: i32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub reaper_interval: Duration,
}

impl QueueConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            lease_duration: secs_env("TASK_LEASE_SECS", 300)?,
            max_attempts: parse_optional_env("TASK_MAX_ATTEMPTS", 3)?,
            backoff_base: secs_env("TASK_BACKOFF_BASE_SECS", 10)?,
            backoff_cap: secs_env("TASK_BACKOFF_CAP_SECS", 300)?,
            reaper_interval: secs_env("REAPER_INTERVAL_SECS", 30)?,
        })
    }
}

/// Agent dispatcher behavior.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub heartbeat_healthy_window: Duration,
    pub offline_threshold: Duration,
    pub long_poll_default: Duration,
    pub long_poll_max: Duration,
}

impl DispatchConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            heartbeat_healthy_window: secs_env("HEARTBEAT_HEALTHY_WINDOW_SECS", 60)?,
            offline_threshold: secs_env("OFFLINE_THRESHOLD_SECS", 300)?,
            long_poll_default: secs_env("LONG_POLL_DEFAULT_SECS", 30)?,
            long_poll_max: secs_env("LONG_POLL_MAX_SECS", 120)?,
        })
    }
}

/// Statistical analyzer defaults.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub min_sample: usize,
    pub alpha: f64,
}

impl AnalyzerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let alpha: f64 = parse_optional_env("ANALYZER_ALPHA", 0.05)?;
        if !(0.0..1.0).contains(&alpha) || alpha == 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "ANALYZER_ALPHA".to_string(),
                message: format!("{alpha} is not in (0, 1)"),
            });
        }
        Ok(Self {
            min_sample: parse_optional_env("ANALYZER_MIN_SAMPLE", 30)?,
            alpha,
        })
    }
}

/// Experiment engine behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub collect_interval: Duration,
    pub max_experiment_duration: Duration,
    /// Directory holding pipeline config templates.
    pub template_dir: PathBuf,
}

impl EngineConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            collect_interval: secs_env("COLLECT_INTERVAL_SECS", 10)?,
            max_experiment_duration: secs_env("MAX_EXPERIMENT_DURATION_SECS", 604_800)?,
            template_dir: optional_env("TEMPLATE_DIR")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("templates")),
        })
    }
}

/// Realtime hub behavior.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub client_buffer: usize,
    pub pong_interval: Duration,
    pub idle_timeout: Duration,
}

impl HubConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            client_buffer: parse_optional_env("WS_CLIENT_BUFFER", 100)?,
            pong_interval: secs_env("WS_PONG_INTERVAL_SECS", 30)?,
            idle_timeout: secs_env("WS_IDLE_TIMEOUT_SECS", 60)?,
        })
    }
}

/// External metric store (TSDB) settings.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Base URL of the Prometheus-compatible query API.
    pub base_url: Option<String>,
    /// Endpoint collect tasks push samples to.
    pub push_endpoint: String,
}

impl MetricsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: optional_env("METRICS_URL")?,
            push_endpoint: optional_env("METRICS_PUSH_ENDPOINT")?
                .unwrap_or_else(|| "http://localhost:9091".to_string()),
        })
    }
}

// Helper functions

/// Read an env var, treating unset and blank values the same way.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => {
            let value = value.trim();
            if value.is_empty() {
                Ok(None)
            } else {
                Ok(Some(value.to_string()))
            }
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

/// Parse an env var into `T`, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = optional_env(key)? else {
        return Ok(default);
    };
    raw.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}' does not parse: {e}"),
    })
}

/// Parse a `*_SECS` variable as a `Duration`.
pub(crate) fn secs_env(key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_optional_env(key, default_secs)?))
}
