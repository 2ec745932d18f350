//! Configuration types for the runner client.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Platform};

/// Base name of the runner server executable.
pub const DEFAULT_SERVER_BINARY: &str = "runme";

/// Client configuration loaded from YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunnerConfig {
    /// Server settings
    pub server: ServerSettings,
    /// Launch retry settings
    pub retry: RetrySettings,
    /// Output buffering settings
    pub output: OutputSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

impl RunnerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        let config: RunnerConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(Error::Config("server.host cannot be empty".to_string()));
        }

        if self.server.port == 0 {
            return Err(Error::Config("server.port must be > 0".to_string()));
        }

        if self.retry.poll_attempts == 0 {
            return Err(Error::Config("retry.poll_attempts must be > 0".to_string()));
        }

        if self.retry.poll_interval_ms == 0 {
            return Err(Error::Config(
                "retry.poll_interval_ms must be > 0".to_string(),
            ));
        }

        if self.retry.max_backoff_ms < self.retry.backoff_ms {
            return Err(Error::Config(
                "retry.max_backoff_ms must be >= retry.backoff_ms".to_string(),
            ));
        }

        if self.output.coalesce_ms > 1000 {
            return Err(Error::Config(
                "output.coalesce_ms must be <= 1000".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the supervisor configuration from these settings.
    pub fn server_config(&self) -> ServerConfig {
        let binary_path = self.server.binary_path.clone().unwrap_or_else(|| {
            PathBuf::from(Platform::detect().executable_name(DEFAULT_SERVER_BINARY))
        });
        let tls_dir = self
            .server
            .tls_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("runme").join("tls"));

        ServerConfig {
            binary_path,
            host: self.server.host.clone(),
            port: self.server.port,
            tls_enabled: self.server.tls_enabled,
            tls_dir,
            managed: self.server.managed,
            extra_args: self.server.extra_args.clone(),
            retry: self.retry.policy(),
        }
    }
}

/// Server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Path to the server binary (platform default when unset)
    pub binary_path: Option<PathBuf>,
    /// Interface the server listens on
    pub host: String,
    /// First candidate port
    pub port: u16,
    /// Use TLS for the connection
    pub tls_enabled: bool,
    /// Directory holding cert.pem and key.pem
    pub tls_dir: Option<PathBuf>,
    /// Spawn the server (true) or connect to an external one (false)
    pub managed: bool,
    /// Additional arguments passed to the server
    pub extra_args: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            binary_path: None,
            host: "127.0.0.1".to_string(),
            port: 7863,
            tls_enabled: true,
            tls_dir: None,
            managed: true,
            extra_args: vec![],
        }
    }
}

/// Launch retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retry a failed launch on the next port
    pub retry_on_failure: bool,
    /// Retries after the first attempt
    pub max_attempts: u32,
    /// Backoff before the first retry, in milliseconds
    pub backoff_ms: u64,
    /// Backoff ceiling, in milliseconds
    pub max_backoff_ms: u64,
    /// Health checks per launch attempt
    pub poll_attempts: u32,
    /// Delay between health checks, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retry_on_failure: true,
            max_attempts: 3,
            backoff_ms: 100,
            max_backoff_ms: 2000,
            poll_attempts: 50,
            poll_interval_ms: 200,
        }
    }
}

impl RetrySettings {
    /// Runtime retry policy.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_on_failure: self.retry_on_failure,
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            acceptance: AcceptancePoll {
                attempts: self.poll_attempts,
                interval: Duration::from_millis(self.poll_interval_ms),
            },
        }
    }
}

/// Output buffering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Coalescing window for non-interactive output, in milliseconds
    pub coalesce_ms: u64,
    /// Coalesce stderr the same way as stdout
    pub coalesce_stderr: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            coalesce_ms: 25,
            coalesce_stderr: false,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Health-check polling after a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptancePoll {
    /// Number of checks
    pub attempts: u32,
    /// Delay between checks
    pub interval: Duration,
}

/// Retry policy of the server supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry a failed launch on the next port
    pub retry_on_failure: bool,
    /// Retries after the first attempt
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Acceptance polling per attempt
    pub acceptance: AcceptancePoll,
}

impl RetryPolicy {
    /// Total launch attempts, the first one included.
    pub fn total_attempts(&self) -> u32 {
        if self.retry_on_failure {
            self.max_attempts.saturating_add(1)
        } else {
            1
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().policy()
    }
}

/// Supervisor configuration.
///
/// Constructed once per activation; `port` advances in place across retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Server binary
    pub binary_path: PathBuf,
    /// Interface the server listens on
    pub host: String,
    /// Current candidate port
    pub port: u16,
    /// Use TLS for the connection
    pub tls_enabled: bool,
    /// Directory holding cert.pem and key.pem
    pub tls_dir: PathBuf,
    /// Spawn the server (true) or connect to an external one (false)
    pub managed: bool,
    /// Additional arguments passed to the server
    pub extra_args: Vec<String>,
    /// Launch retry policy
    pub retry: RetryPolicy,
}

impl ServerConfig {
    /// Address for the current candidate port.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        RunnerConfig::default().server_config()
    }
}
