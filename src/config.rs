//! Telemetry configuration loading from environment variables and an
//! optional TOML file.
//!
//! Environment values override file values; invalid values fall back to
//! defaults without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `TELEMETRY_EXTERNAL_HOST` | unset | Ingestion endpoint host (http/https URL) |
//! | `TELEMETRY_EXTERNAL_PUBLIC_KEY` | unset | Ingestion public key |
//! | `TELEMETRY_EXTERNAL_SECRET_KEY` | unset | Ingestion secret key |
//! | `TELEMETRY_SPOOL_DIR` | `./telemetry-spool` | Directory for spooled batches |
//! | `TELEMETRY_FLUSH_TIMEOUT_MS` | 5000 | External flush bound (floor 50) |
//! | `TELEMETRY_MAX_ERROR_CHARS` | 2000 | Stored error message cap (floor 64) |
//! | `TELEMETRY_MAX_PREVIEW_CHARS` | 500 | Stored content preview cap (floor 16) |
//! | `TELEMETRY_LOG_LEVEL` | `info` | Log filter |
//! | `TELEMETRY_LOG_FORMAT` | `json` | `json` or `pretty` |
//! | `TELEMETRY_LOG_FILE` | unset | Append logs to this file instead of stderr |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::{LogConfig, LogFormat};

const DEFAULT_SPOOL_DIR: &str = "./telemetry-spool";
const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 5000;
const MIN_FLUSH_TIMEOUT_MS: u64 = 50;
const DEFAULT_MAX_ERROR_CHARS: usize = 2000;
const MIN_ERROR_CHARS: usize = 64;
const DEFAULT_MAX_PREVIEW_CHARS: usize = 500;
const MIN_PREVIEW_CHARS: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// External sync backend settings.
#[derive(Clone)]
pub struct ExternalConfig {
    pub host: Option<String>,
    pub public_key: Option<String>,
    pub secret_key: Option<String>,
    pub spool_dir: PathBuf,
    pub flush_timeout: Duration,
}

impl std::fmt::Debug for ExternalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalConfig")
            .field("host", &self.host)
            .field("public_key", &self.public_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("spool_dir", &self.spool_dir)
            .field("flush_timeout", &self.flush_timeout)
            .finish()
    }
}

impl ExternalConfig {
    /// True when every credential is present.
    pub fn has_credentials(&self) -> bool {
        self.host.is_some() && self.public_key.is_some() && self.secret_key.is_some()
    }
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            host: None,
            public_key: None,
            secret_key: None,
            spool_dir: PathBuf::from(DEFAULT_SPOOL_DIR),
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
        }
    }
}

/// All telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub external: ExternalConfig,
    pub max_error_chars: usize,
    pub max_preview_chars: usize,
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            external: ExternalConfig::default(),
            max_error_chars: DEFAULT_MAX_ERROR_CHARS,
            max_preview_chars: DEFAULT_MAX_PREVIEW_CHARS,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            log_file: None,
        }
    }
}

/// Shape of the optional TOML file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub external_host: Option<String>,
    pub external_public_key: Option<String>,
    pub external_secret_key: Option<String>,
    pub spool_dir: Option<PathBuf>,
    pub flush_timeout_ms: Option<u64>,
    pub max_error_chars: Option<usize>,
    pub max_preview_chars: Option<usize>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl FileConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

/// Redacted, serializable summary of the effective configuration.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub external_enabled: bool,
    pub external_host: Option<String>,
    pub external_public_key: Option<String>,
    pub external_secret_key_set: bool,
    pub spool_dir: String,
    pub flush_timeout_ms: u64,
    pub max_error_chars: usize,
    pub max_preview_chars: usize,
    pub log_level: String,
    pub log_format: String,
    pub log_file: Option<String>,
}

/// Non-empty, trimmed string env var.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a `usize` env var, returning None on missing or invalid.
fn env_usize(key: &str) -> Option<usize> {
    env_string(key).and_then(|v| v.parse::<usize>().ok())
}

/// Parse a `u64` env var, returning None on missing or invalid.
fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|v| v.parse::<u64>().ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_log_format(value: &str) -> Option<LogFormat> {
    match value.to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}

/// Load external sync settings.
fn load_external(file: &FileConfig) -> ExternalConfig {
    let host = env_string("TELEMETRY_EXTERNAL_HOST").or_else(|| non_empty(file.external_host.clone()));
    let public_key = env_string("TELEMETRY_EXTERNAL_PUBLIC_KEY")
        .or_else(|| non_empty(file.external_public_key.clone()));
    let secret_key = env_string("TELEMETRY_EXTERNAL_SECRET_KEY")
        .or_else(|| non_empty(file.external_secret_key.clone()));
    let spool_dir = env_string("TELEMETRY_SPOOL_DIR")
        .map(PathBuf::from)
        .or_else(|| file.spool_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SPOOL_DIR));
    let flush_ms = env_u64("TELEMETRY_FLUSH_TIMEOUT_MS")
        .or(file.flush_timeout_ms)
        .unwrap_or(DEFAULT_FLUSH_TIMEOUT_MS)
        .max(MIN_FLUSH_TIMEOUT_MS);

    ExternalConfig {
        host,
        public_key,
        secret_key,
        spool_dir,
        flush_timeout: Duration::from_millis(flush_ms),
    }
}

/// Load configuration from environment variables only.
pub fn load() -> TelemetryConfig {
    load_with_file(&FileConfig::default())
}

/// Load configuration, with environment variables overriding `file`.
pub fn load_with_file(file: &FileConfig) -> TelemetryConfig {
    let max_error_chars = env_usize("TELEMETRY_MAX_ERROR_CHARS")
        .or(file.max_error_chars)
        .unwrap_or(DEFAULT_MAX_ERROR_CHARS)
        .max(MIN_ERROR_CHARS);
    let max_preview_chars = env_usize("TELEMETRY_MAX_PREVIEW_CHARS")
        .or(file.max_preview_chars)
        .unwrap_or(DEFAULT_MAX_PREVIEW_CHARS)
        .max(MIN_PREVIEW_CHARS);
    let log_level = env_string("TELEMETRY_LOG_LEVEL")
        .or_else(|| non_empty(file.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let log_format = env_string("TELEMETRY_LOG_FORMAT")
        .or_else(|| file.log_format.clone())
        .and_then(|v| parse_log_format(&v))
        .unwrap_or_default();
    let log_file = env_string("TELEMETRY_LOG_FILE")
        .map(PathBuf::from)
        .or_else(|| file.log_file.clone());

    TelemetryConfig {
        external: load_external(file),
        max_error_chars,
        max_preview_chars,
        log_level,
        log_format,
        log_file,
    }
}

impl TelemetryConfig {
    /// Logging settings derived from this configuration.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            format: self.log_format,
            level: self.log_level.clone(),
            output_path: self.log_file.clone(),
        }
    }

    /// Return a redacted summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            external_enabled: self.external.has_credentials(),
            external_host: self.external.host.clone(),
            external_public_key: self.external.public_key.clone(),
            external_secret_key_set: self.external.secret_key.is_some(),
            spool_dir: self.external.spool_dir.display().to_string(),
            flush_timeout_ms: self.external.flush_timeout.as_millis() as u64,
            max_error_chars: self.max_error_chars,
            max_preview_chars: self.max_preview_chars,
            log_level: self.log_level.clone(),
            log_format: match self.log_format {
                LogFormat::Json => "json".to_string(),
                LogFormat::Pretty => "pretty".to_string(),
            },
            log_file: self.log_file.as_ref().map(|p| p.display().to_string()),
        }
    }
}
