use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8788";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_WEB_SCHEME: &str = "http";
const DEFAULT_MINIMUM_TOS: u32 = 20_110_623;
const DEFAULT_GRANT_TYPE_NAMESPACE: &str = "urn:waypost:grant:";
const DEFAULT_TICKET_TTL_SECONDS: u64 = 3600;
const DEFAULT_GRANT_TTL_SECONDS: u64 = 2_592_000;
const DEFAULT_JAR_TTL_SECONDS: u64 = 600;
const DEFAULT_WEB_CLIENT_ID: &str = "waypost.web";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
/// One hundred years.
const MAX_TTL_SECONDS: u64 = 3_155_760_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub log_json: bool,
    pub web_scheme: String,
    pub session_secret: String,
    pub ticket_secret: String,
    pub jar_secret: String,
    pub minimum_tos: u32,
    pub grant_type_namespace: String,
    pub ticket_ttl_seconds: u64,
    pub grant_ttl_seconds: u64,
    pub jar_ttl_seconds: u64,
    pub api_base_url: Option<String>,
    pub web_client_id: String,
    pub web_client_secret: Option<String>,
    pub store_path: Option<PathBuf>,
    pub http_timeout_ms: u64,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid WAYPOST_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid WAYPOST_WEB_SCHEME value '{value}': expected http or https")]
    InvalidWebScheme { value: String },
    #[error("{var} must be set")]
    MissingSecret { var: &'static str },
    #[error("invalid {var} value '{value}': expected at most {MAX_TTL_SECONDS} seconds")]
    InvalidTtl { var: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env::var("WAYPOST_BIND_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = env::var("WAYPOST_LOG_FILTER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let log_json = env::var("WAYPOST_LOG_FORMAT")
            .ok()
            .map(|value| value.trim().eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let web_scheme = env::var("WAYPOST_WEB_SCHEME")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WEB_SCHEME.to_string())
            .trim()
            .to_lowercase();
        if web_scheme != "http" && web_scheme != "https" {
            return Err(ConfigError::InvalidWebScheme { value: web_scheme });
        }

        let session_secret = required_secret("WAYPOST_SESSION_SECRET")?;
        let ticket_secret = required_secret("WAYPOST_TICKET_SECRET")?;
        let jar_secret = required_secret("WAYPOST_JAR_SECRET")?;

        let minimum_tos = env::var("WAYPOST_MINIMUM_TOS")
            .ok()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_MINIMUM_TOS);

        let grant_type_namespace = env::var("WAYPOST_GRANT_TYPE_NAMESPACE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GRANT_TYPE_NAMESPACE.to_string());

        let ticket_ttl_seconds = ttl_seconds(
            "WAYPOST_TICKET_TTL_SECONDS",
            env::var("WAYPOST_TICKET_TTL_SECONDS").ok(),
            DEFAULT_TICKET_TTL_SECONDS,
        )?;

        let grant_ttl_seconds = ttl_seconds(
            "WAYPOST_GRANT_TTL_SECONDS",
            env::var("WAYPOST_GRANT_TTL_SECONDS").ok(),
            DEFAULT_GRANT_TTL_SECONDS,
        )?;

        let jar_ttl_seconds = ttl_seconds(
            "WAYPOST_JAR_TTL_SECONDS",
            env::var("WAYPOST_JAR_TTL_SECONDS").ok(),
            DEFAULT_JAR_TTL_SECONDS,
        )?;

        let api_base_url = env::var("WAYPOST_API_BASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let web_client_id = env::var("WAYPOST_WEB_CLIENT_ID")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WEB_CLIENT_ID.to_string());

        let web_client_secret = env::var("WAYPOST_WEB_CLIENT_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let store_path = env::var("WAYPOST_STORE_PATH")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let http_timeout_ms = env::var("WAYPOST_HTTP_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS);

        let request_timeout_seconds = env::var("WAYPOST_REQUEST_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS);

        Ok(Self {
            bind_addr,
            log_filter,
            log_json,
            web_scheme,
            session_secret,
            ticket_secret,
            jar_secret,
            minimum_tos,
            grant_type_namespace,
            ticket_ttl_seconds,
            grant_ttl_seconds,
            jar_ttl_seconds,
            api_base_url,
            web_client_id,
            web_client_secret,
            store_path,
            http_timeout_ms,
            request_timeout_seconds,
        })
    }

    pub fn secure_cookies(&self) -> bool {
        self.web_scheme == "https"
    }
}

fn ttl_seconds(var: &'static str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = raw.map(|value| value.trim().to_string()) else {
        return Ok(default);
    };
    match raw.parse::<u64>() {
        Ok(value) if value <= MAX_TTL_SECONDS => Ok(value),
        Ok(_) => Err(ConfigError::InvalidTtl { var, value: raw }),
        Err(_) => Ok(default),
    }
}

fn required_secret(var: &'static str) -> Result<String, ConfigError> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingSecret { var })
}

#[cfg(test)]
impl Config {
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            log_json: false,
            web_scheme: "http".to_string(),
            session_secret: "session-test-secret".to_string(),
            ticket_secret: "ticket-test-secret".to_string(),
            jar_secret: "jar-test-secret".to_string(),
            minimum_tos: DEFAULT_MINIMUM_TOS,
            grant_type_namespace: DEFAULT_GRANT_TYPE_NAMESPACE.to_string(),
            ticket_ttl_seconds: DEFAULT_TICKET_TTL_SECONDS,
            grant_ttl_seconds: DEFAULT_GRANT_TTL_SECONDS,
            jar_ttl_seconds: DEFAULT_JAR_TTL_SECONDS,
            api_base_url: None,
            web_client_id: DEFAULT_WEB_CLIENT_ID.to_string(),
            web_client_secret: None,
            store_path: None,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
        }
    }
}
