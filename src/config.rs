use crate::error::{GatewayError, Result};
use crate::models::parse_proxy_list;
use crate::proxy::rotation::RoundRobinPool;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Port for the proxy server (default: 8085)
    pub port: u16,
    /// Gateway username
    pub auth_username: String,
    /// Gateway password; authentication is disabled while either is empty
    pub auth_password: String,
    /// Path to the newline-delimited upstream list
    pub proxy_list: Option<String>,
    /// Seconds allowed to receive the request head
    pub read_timeout: u64,
    /// Seconds allowed for writes before the connection is hijacked
    pub write_timeout: u64,
    /// Seconds allowed to connect to an upstream
    pub connect_timeout: u64,
}

impl ProxyServerConfig {
    /// Get the listen address
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig {
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                port: get_env_or("PROXY_PORT", "8085").parse().map_err(|_| {
                    GatewayError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                auth_username: get_env_or("PROXY_USER", "user"),
                auth_password: get_env_or("PROXY_PASSWORD", ""),
                proxy_list: Some(get_env_or("PROXY_LIST", ""))
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                read_timeout: parse_secs("PROXY_READ_TIMEOUT", "5")?,
                write_timeout: parse_secs("PROXY_WRITE_TIMEOUT", "10")?,
                connect_timeout: parse_secs("PROXY_CONNECT_TIMEOUT", "10")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Read the upstream list and build the rotation pool
    ///
    /// An unset list path or a list without entries is rejected here so the
    /// process never starts with nothing to rotate through.
    pub fn load_pool(&self) -> Result<RoundRobinPool> {
        let Some(path) = &self.proxy.proxy_list else {
            return Err(GatewayError::PoolEmpty);
        };

        let contents =
            std::fs::read_to_string(path).map_err(|source| GatewayError::ProxyListRead {
                path: path.clone(),
                source,
            })?;

        let pool: RoundRobinPool = parse_proxy_list(&contents)?.into_iter().collect();
        if pool.is_empty() {
            return Err(GatewayError::PoolEmpty);
        }

        Ok(pool)
    }
}

/// Parse a timeout in whole seconds; zero is rejected
fn parse_secs(key: &str, default: &str) -> Result<u64> {
    match get_env_or(key, default).parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(GatewayError::InvalidConfig(format!(
            "{} must be a positive number of seconds",
            key
        ))),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
