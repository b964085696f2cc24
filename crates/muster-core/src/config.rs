use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.muster/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `~/.muster/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings not expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.approvals.validate()?;
        self.execution.validate()?;
        self.streaming.validate()?;
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".muster")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Pending requests older than this are auto-rejected, never
    /// auto-approved.
    pub horizon_secs: u64,
    /// How often the expiry sweeper runs.
    pub sweep_interval_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            horizon_secs: 120,
            sweep_interval_secs: 5,
        }
    }
}

impl ApprovalConfig {
    pub fn horizon(&self) -> Duration {
        Duration::from_secs(self.horizon_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.horizon_secs == 0 {
            return Err(ConfigError::Validation(
                "approvals.horizon_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Hard wall-clock deadline for one execution attempt.
    pub step_timeout_secs: u64,
    /// Maximum attempts per step, counting the first.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    /// Jitter fraction in `0.0..=1.0`; each backoff delay is multiplied
    /// by a random factor in `1 - jitter ..= 1 + jitter`.
    pub jitter: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 300,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl ExecutionConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "execution.max_attempts must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Validation(
                "execution.jitter must be in 0.0..=1.0".into(),
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::Validation(
                "execution.backoff_factor must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Retained chunks per task stream; consumers resuming below the
    /// retention floor get a cursor-evicted error.
    pub retention_chunks: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            retention_chunks: 4096,
        }
    }
}

impl StreamingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_chunks == 0 {
            return Err(ConfigError::Validation(
                "streaming.retention_chunks must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is not set.
    pub filter: String,
    /// Emit JSON log lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.approvals.horizon_secs, 120);
        assert_eq!(cfg.execution.max_attempts, 3);
    }

    #[test]
    fn roundtrip_toml() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.daemon.port, cfg.daemon.port);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[approvals]\nhorizon_secs = 30").unwrap();
        let cfg = Config::load_from(file.path()).unwrap();
        assert_eq!(cfg.approvals.horizon_secs, 30);
        assert_eq!(cfg.execution.max_attempts, 3);
    }

    #[test]
    fn zero_horizon_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[approvals]\nhorizon_secs = 0").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }

    #[test]
    fn out_of_range_jitter_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[execution]\njitter = 1.5").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }
}
