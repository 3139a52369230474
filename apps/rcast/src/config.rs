// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::Level;

const fn default_grace_secs() -> u64 {
    10
}

const fn default_max_header_bytes() -> usize {
    // The initialization segment is tiny in practice; this only guards
    // against hostile publishers.
    1024 * 1024
}

const fn default_read_chunk_hint() -> usize {
    16 * 1024
}

/// Relay lifecycle and parsing limits.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct RelayConfig {
    /// Grace window in seconds after a publisher disconnect during which a
    /// reconnect resumes the same session.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Cap on a stream's retained initialization segment in bytes.
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Advisory publisher read granularity in bytes. The relay feeds the
    /// parser whatever chunks the HTTP stack delivers, so this only
    /// documents the intended pacing for publishing clients and tools.
    #[serde(default = "default_read_chunk_hint")]
    pub read_chunk_hint: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
            max_header_bytes: default_max_header_bytes(),
            read_chunk_hint: default_read_chunk_hint(),
        }
    }
}

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation but slower)
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    /// Format for file logging: "text" (default, faster) or "json" (structured)
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./rcast.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_cors_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// CORS configuration for cross-origin requests.
///
/// Streams are public by design, so the default allows every origin; tighten
/// this when fronting the relay with an auth layer.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests. `["*"]` allows all origins.
    #[serde(default = "default_cors_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: default_cors_allowed_origins() }
    }
}

/// Telemetry and observability configuration (OpenTelemetry metrics).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    /// OTLP endpoint for metrics export. When unset, metrics are collected
    /// locally but not exported.
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enable: true, otlp_endpoint: None, otlp_headers: HashMap::new() }
    }
}

/// HTTP server configuration.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ServerConfig {
    pub address: String,
    /// CORS configuration for cross-origin requests
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: "127.0.0.1:8000".to_string(), cors: CorsConfig::default() }
    }
}

/// Top-level application configuration.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the application configuration from defaults, a TOML file, and
/// environment variables.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file exists but contains invalid TOML syntax
/// - Environment variables are set but contain invalid values
/// - Configuration values fail validation (e.g., invalid types)
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    // Try to load the config file, but don't fail if it doesn't exist
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("RC_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to
/// TOML. This is extremely unlikely in practice as it would indicate a
/// programming error.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    let default_config = Config::default();
    toml::to_string_pretty(&default_config)
}
