//! Configuration for Mailgate
//!
//! Settings are read from a TOML file and then overridden by environment
//! variables prefixed with `MAILGATE__`, using `__` as the section
//! separator (`MAILGATE__DATABASE__URL`, `MAILGATE__SMTP__PORT`, ...).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "MAILGATE_CONFIG";

/// Prefix for environment overrides
const ENV_PREFIX: &str = "MAILGATE";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// SMTP configuration (relay and submission listeners)
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// IMAP configuration
    #[serde(default)]
    pub imap: ImapConfig,

    /// API token authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// TLS configuration
    pub tls: Option<TlsConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname announced in protocol banners
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Mail domain served by this gateway; the relay listener only
    /// accepts recipients in this domain
    #[serde(default = "default_email_domain")]
    pub email_domain: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            email_domain: default_email_domain(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_email_domain() -> String {
    "localhost".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    30
}

/// SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Bind host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// Relay port (inbound, unauthenticated)
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Submission port (authenticated)
    #[serde(default = "default_submission_port")]
    pub submission_port: u16,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum recipients per message
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum concurrent connections per listener
    #[serde(default = "default_smtp_max_connections")]
    pub max_connections: usize,

    /// Idle read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Allow AUTH over a plaintext connection when TLS is configured
    #[serde(default)]
    pub allow_insecure_auth: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            submission_port: default_submission_port(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            max_connections: default_smtp_max_connections(),
            read_timeout_secs: default_read_timeout(),
            allow_insecure_auth: false,
        }
    }
}

fn default_smtp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_submission_port() -> u16 {
    587
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_max_recipients() -> usize {
    100
}

fn default_smtp_max_connections() -> usize {
    100
}

fn default_read_timeout() -> u64 {
    300
}

/// IMAP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    /// Enable IMAP server
    #[serde(default = "default_imap_enabled")]
    pub enabled: bool,

    /// IMAP server bind address
    #[serde(default = "default_imap_bind")]
    pub bind: String,

    /// Session timeout in minutes
    #[serde(default = "default_imap_timeout")]
    pub timeout_minutes: u64,

    /// Maximum concurrent connections
    #[serde(default = "default_imap_max_connections")]
    pub max_connections: usize,

    /// Allow LOGIN over a plaintext connection when TLS is configured
    #[serde(default)]
    pub allow_insecure_auth: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            enabled: default_imap_enabled(),
            bind: default_imap_bind(),
            timeout_minutes: default_imap_timeout(),
            max_connections: default_imap_max_connections(),
            allow_insecure_auth: false,
        }
    }
}

fn default_imap_enabled() -> bool {
    true
}

fn default_imap_bind() -> String {
    "0.0.0.0:143".to_string()
}

fn default_imap_timeout() -> u64 {
    30
}

fn default_imap_max_connections() -> usize {
    1000
}

/// API token authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// How long a resolved token stays cached, in seconds
    #[serde(default = "default_token_cache_ttl")]
    pub token_cache_ttl_secs: u64,

    /// Interval between prune passes, in seconds
    #[serde(default = "default_token_prune_interval")]
    pub token_prune_interval_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_cache_ttl_secs: default_token_cache_ttl(),
            token_prune_interval_secs: default_token_prune_interval(),
        }
    }
}

fn default_token_cache_ttl() -> u64 {
    300
}

fn default_token_prune_interval() -> u64 {
    3600
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    pub cert_path: PathBuf,

    /// Path to private key file
    pub key_path: PathBuf,
}

impl Config {
    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a file, layered under `MAILGATE__*` variables
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        Self::build(Some(path))
    }

    /// Load configuration from the default locations and the environment
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/mailgate/config.toml"),
        ];

        match paths.iter().find(|path| path.exists()) {
            Some(path) => Self::from_file(path),
            None => Self::build(None),
        }
    }

    fn build(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let server = ServerConfig::default();
        assert_eq!(server.hostname, "localhost");

        let smtp = SmtpConfig::default();
        assert_eq!(smtp.port, 25);
        assert_eq!(smtp.submission_port, 587);
        assert_eq!(smtp.max_recipients, 100);

        let imap = ImapConfig::default();
        assert_eq!(imap.bind, "0.0.0.0:143");
        assert!(imap.enabled);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "mx.example.com"
email_domain = "example.com"

[database]
url = "postgres://localhost/mailgate"

[smtp]
port = 2525
submission_port = 5870

[imap]
bind = "127.0.0.1:1143"

[logging]
format = "text"
"#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.server.hostname, "mx.example.com");
        assert_eq!(config.server.email_domain, "example.com");
        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/mailgate"));
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.smtp.submission_port, 5870);
        assert_eq!(config.imap.bind, "127.0.0.1:1143");
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.auth.token_cache_ttl_secs, 300);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.smtp.max_message_size, 10 * 1024 * 1024);
        assert_eq!(config.logging.level, "info");
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Config::from_toml_str("[smtp]\nport = \"not a number\"").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
