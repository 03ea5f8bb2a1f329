//! Configuration module for environment variables

use std::{
    env,
    fmt::Display,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};
use tracing::Level;
use url::Url;
use wreq_util::Emulation;

use crate::{
    backend::BackendChoice,
    forward::{available_profiles, default_profile, parse_tls_profile},
    error::ConfigError,
};

const DEFAULT_WEBDRIVER_URL: &str = "http://127.0.0.1:9515";

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address (default: 0.0.0.0)
    pub host: IpAddr,
    /// Server port (default: 8191)
    pub port: u16,
    /// Log level (default: info)
    pub log_level: String,
    /// Log page HTML at debug level (default: false)
    pub log_html: bool,
    /// Run browsers headless (default: true)
    pub headless: bool,
    /// Backend that owns every solve in this process (default: webdriver)
    pub driver: BackendChoice,
    /// Maximum concurrent solves (default: 16)
    pub max_concurrent: usize,
    /// Server request timeout in seconds (default: 600)
    pub server_timeout: u64,
    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,
    /// W3C WebDriver endpoint used by the webdriver backend
    pub webdriver_url: Url,
    /// Chrome executable used by the cdp backend (default: auto-detect)
    pub browser_path: Option<PathBuf>,
    /// TLS fingerprint used by the content forwarding endpoint
    pub content_tls_profile: Emulation,
    /// Serve Prometheus metrics (default: false)
    pub prometheus_enabled: bool,
    /// Port of the metrics listener (default: 8192)
    pub prometheus_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Every value is validated here; a bad value never reaches the server.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup("LOG_LEVEL")
            .map(|v| v.trim().to_lowercase())
            .unwrap_or_else(|| "info".to_string());
        if let Err(e) = log_level.parse::<Level>() {
            return Err(ConfigError::InvalidValue {
                name: "LOG_LEVEL",
                value: log_level,
                reason: e.to_string(),
            });
        }

        let driver = match lookup("DRIVER") {
            Some(value) => value.parse()?,
            None => BackendChoice::default(),
        };

        let max_concurrent: usize = parse_var(&lookup, "MAX_CONCURRENT", 16)?;
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MAX_CONCURRENT",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let content_tls_profile = match lookup("CONTENT_TLS_PROFILE") {
            Some(profile) => parse_tls_profile(profile.trim()).map_err(|invalid| {
                ConfigError::InvalidTlsProfile {
                    profile: invalid,
                    available: available_profiles(),
                }
            })?,
            None => default_profile(),
        };

        let webdriver_url = lookup("WEBDRIVER_URL").unwrap_or_else(|| DEFAULT_WEBDRIVER_URL.to_string());
        let webdriver_url = Url::parse(webdriver_url.trim()).map_err(|e| ConfigError::InvalidValue {
            name: "WEBDRIVER_URL",
            value: webdriver_url.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            host: parse_var(&lookup, "HOST", IpAddr::from([0, 0, 0, 0]))?,
            port: parse_var(&lookup, "PORT", 8191)?,
            log_level,
            log_html: parse_bool(&lookup, "LOG_HTML", false)?,
            headless: parse_bool(&lookup, "HEADLESS", true)?,
            driver,
            max_concurrent,
            server_timeout: parse_var(&lookup, "SERVER_TIMEOUT", 600)?,
            max_request_body_size: parse_var(&lookup, "MAX_REQUEST_BODY_SIZE", 1024 * 1024)?, // 1MB
            webdriver_url,
            browser_path: lookup("BROWSER_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            content_tls_profile,
            prometheus_enabled: parse_bool(&lookup, "PROMETHEUS_ENABLED", false)?,
            prometheus_port: parse_var(&lookup, "PROMETHEUS_PORT", 8192)?,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Where the metrics listener binds, when enabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.prometheus_enabled
            .then(|| SocketAddr::new(self.host, self.prometheus_port))
    }

    /// Debug and trace levels also surface thread ids and browser protocol chatter.
    pub fn is_verbose(&self) -> bool {
        matches!(self.log_level.as_str(), "debug" | "trace")
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                name,
                value,
                reason: e.to_string(),
            }),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name,
                value,
                reason: "expected true or false".to_string(),
            }),
        },
        None => Ok(default),
    }
}
