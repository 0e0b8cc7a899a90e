use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::error::ApiError;

/// Fieldbook session companion
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "4200")]
    pub port: u16,

    /// Base URL of the identity provider
    #[arg(
        short = 'u',
        long,
        env = "PROVIDER_URL",
        default_value = "https://ketsan.mnhduc.site"
    )]
    pub provider_url: String,

    /// Path to the SQLite file holding the persisted session
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Identity provider
    pub provider_url: String,

    // Persisted session
    pub session_db_file: PathBuf,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Build configuration from already parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let session_db_file = match args.db_file {
            Some(path) => expand_tilde(&path),
            None => default_db_path()
                .context("Cannot locate a data directory (use -d or set SESSION_DB_FILE)")?,
        };

        Ok(Config {
            server_host: args.host,
            server_port: args.port,

            provider_url: args.provider_url.trim_end_matches('/').to_string(),

            session_db_file,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        let url = reqwest::Url::parse(&self.provider_url).map_err(|e| {
            ApiError::ConfigError(format!(
                "PROVIDER_URL is not a valid URL ({}): {}",
                e, self.provider_url
            ))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ApiError::ConfigError(format!(
                "PROVIDER_URL must use http or https, got: {}",
                url.scheme()
            )));
        }

        if self.http_request_timeout == 0 {
            return Err(ApiError::ConfigError(
                "HTTP_REQUEST_TIMEOUT must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_db_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("fieldbook").join("session.sqlite3"))
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}
