use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{ExchangeSettings, SessionSettings, DEFAULT_EXPIRATION_BUFFER_MS};

/// Session and token endpoint options
#[derive(Args, Debug, Clone)]
pub struct CliArgs {
    /// Authorization server token endpoint
    #[arg(long, env = "OAUTH_TOKEN_URL")]
    pub token_url: Option<String>,

    /// Authorization server revocation endpoint
    #[arg(long, env = "OAUTH_REVOKE_URL")]
    pub revoke_url: Option<String>,

    /// OAuth client id
    #[arg(short = 'c', long, env = "OAUTH_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret (enables client-credentials sessions)
    #[arg(long, env = "OAUTH_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Scope requested by client-credentials grants
    #[arg(long, env = "OAUTH_SCOPE")]
    pub scope: Option<String>,

    /// Key addressing this session in the credential store
    #[arg(short = 'i', long, env = "SESSION_IDENTITY", default_value = "default")]
    pub identity: String,

    /// Path to SQLite credential store
    #[arg(short = 'd', long, env = "CREDENTIALS_DB_FILE")]
    pub db_file: Option<String>,

    /// Initial access token when no store is used
    #[arg(long, env = "OAUTH_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Initial refresh token when no store is used
    #[arg(long, env = "OAUTH_REFRESH_TOKEN", hide_env_values = true)]
    pub refresh_token: Option<String>,

    /// Treat tokens as expired this many milliseconds early
    #[arg(long, env = "EXPIRATION_BUFFER_MS", default_value_t = DEFAULT_EXPIRATION_BUFFER_MS)]
    pub expiration_buffer_ms: i64,

    /// Token endpoint attempts per refresh (including the first)
    #[arg(long, env = "TOKEN_MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds
    #[arg(long, env = "TOKEN_RETRY_BASE_DELAY_MS", default_value = "500")]
    pub base_delay_ms: u64,

    /// Per-attempt request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub request_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Token endpoint
    pub token_url: String,
    pub revoke_url: Option<String>,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scope: Option<String>,

    // Session
    pub identity: String,
    pub db_file: Option<PathBuf>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expiration_buffer_ms: i64,

    // HTTP client
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub request_timeout: u64,
    pub connect_timeout: u64,

    pub log_level: String,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            token_url: args
                .token_url
                .context("OAUTH_TOKEN_URL is required (use --token-url or set OAUTH_TOKEN_URL)")?,
            revoke_url: args.revoke_url,
            client_id: args
                .client_id
                .context("OAUTH_CLIENT_ID is required (use -c or set OAUTH_CLIENT_ID)")?,
            client_secret: args.client_secret,
            scope: args.scope,

            identity: args.identity,
            db_file: args.db_file.map(|s| expand_tilde(&s)),
            access_token: args.access_token,
            refresh_token: args.refresh_token,
            expiration_buffer_ms: args.expiration_buffer_ms,

            max_attempts: args.max_attempts,
            base_delay_ms: args.base_delay_ms,
            request_timeout: args.request_timeout,
            connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            anyhow::bail!("OAUTH_CLIENT_ID cannot be empty");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("TOKEN_MAX_ATTEMPTS must be at least 1");
        }
        if self.expiration_buffer_ms < 0 {
            anyhow::bail!("EXPIRATION_BUFFER_MS cannot be negative");
        }
        if let Some(parent) = self.db_file.as_ref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                anyhow::bail!(
                    "Directory for CREDENTIALS_DB_FILE does not exist: {}",
                    parent.display()
                );
            }
        }
        Ok(())
    }

    pub fn exchange_settings(&self) -> ExchangeSettings {
        ExchangeSettings {
            token_url: self.token_url.clone(),
            revoke_url: self.revoke_url.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            scope: self.scope.clone(),
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            request_timeout: Duration::from_secs(self.request_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            expiration_buffer_ms: self.expiration_buffer_ms,
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> CliArgs {
        CliArgs {
            token_url: Some("https://auth.example.com/oauth2/token".to_string()),
            revoke_url: None,
            client_id: Some("client-1".to_string()),
            client_secret: None,
            scope: None,
            identity: "default".to_string(),
            db_file: None,
            access_token: None,
            refresh_token: Some("refresh-1".to_string()),
            expiration_buffer_ms: DEFAULT_EXPIRATION_BUFFER_MS,
            max_attempts: 3,
            base_delay_ms: 500,
            request_timeout: 30,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with('~'));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_missing_token_url_is_reported() {
        let mut a = args();
        a.token_url = None;
        let err = Config::from_args(a).unwrap_err();
        assert!(err.to_string().contains("OAUTH_TOKEN_URL"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::from_args(args()).unwrap();
        assert!(config.validate().is_ok());

        config.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_args(args()).unwrap();
        config.client_id = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::from_args(args()).unwrap();
        config.expiration_buffer_ms = -1;
        assert!(config.validate().is_err());

        let mut config = Config::from_args(args()).unwrap();
        config.db_file = Some(PathBuf::from("/definitely/not/here/creds.sqlite3"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_projection() {
        let mut a = args();
        a.base_delay_ms = 250;
        a.expiration_buffer_ms = 10_000;
        let config = Config::from_args(a).unwrap();

        let exchange = config.exchange_settings();
        assert_eq!(exchange.token_url, "https://auth.example.com/oauth2/token");
        assert_eq!(exchange.base_delay, Duration::from_millis(250));
        assert_eq!(exchange.request_timeout, Duration::from_secs(30));
        assert_eq!(config.session_settings().expiration_buffer_ms, 10_000);
    }
}
