//! Application configuration loaded from environment variables.

use crate::error::{AppError, Result};
use std::env;

/// Application configuration
#[derive(Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// Log level
    pub log_level: String,

    /// Default retention window for audit cleanup, in days
    pub retention_days: i32,

    /// Interceptor settings
    pub audit: AuditConfig,
}

// The connection URL can embed credentials; keep it out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field("log_level", &self.log_level)
            .field("retention_days", &self.retention_days)
            .field("audit", &self.audit)
            .finish()
    }
}

/// Settings for the request interceptor, passed once at construction.
///
/// Replaces the ambient option defaults of the original middleware with an
/// explicit injected struct.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Path prefixes that are never audited
    pub exclude_paths: Vec<String>,

    /// HTTP methods that are never audited
    pub exclude_methods: Vec<String>,

    /// Top-level payload keys replaced with the redaction marker
    pub sensitive_fields: Vec<String>,

    /// Capture (redacted) request bodies of mutating requests
    pub log_body: bool,

    /// Capture query parameters into event metadata
    pub log_query: bool,

    /// Capture response summary into event metadata
    pub log_response: bool,

    /// Largest request body the interceptor will snapshot, in bytes
    pub max_body_bytes: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            exclude_paths: split_list("/health,/livez,/ping,/metrics"),
            exclude_methods: Vec::new(),
            sensitive_fields: split_list("password,token,secret,apiKey,creditCard"),
            log_body: true,
            log_query: true,
            log_response: false,
            max_body_bytes: 64 * 1024,
        }
    }
}

/// Split a comma-separated env value into trimmed, non-empty entries.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    split_list(&env::var(key).unwrap_or_else(|_| default.into()))
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".into()))?,
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            retention_days: env::var("AUDIT_RETENTION_DAYS")
                .unwrap_or_else(|_| "365".into())
                .parse()
                .unwrap_or(365),
            audit: AuditConfig {
                exclude_paths: env_list("AUDIT_EXCLUDE_PATHS", "/health,/livez,/ping,/metrics"),
                exclude_methods: env_list("AUDIT_EXCLUDE_METHODS", ""),
                sensitive_fields: env_list(
                    "AUDIT_SENSITIVE_FIELDS",
                    "password,token,secret,apiKey,creditCard",
                ),
                log_body: env_bool("AUDIT_LOG_BODY", true),
                log_query: env_bool("AUDIT_LOG_QUERY", true),
                log_response: env_bool("AUDIT_LOG_RESPONSE", false),
                max_body_bytes: env::var("AUDIT_MAX_BODY_BYTES")
                    .unwrap_or_else(|_| "65536".into())
                    .parse()
                    .unwrap_or(64 * 1024),
            },
        })
    }
}
