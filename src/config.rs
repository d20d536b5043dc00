use crate::error::{RelayError, Result};
use percent_encoding::percent_decode_str;
use std::env;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Upstream dialing behaviour shared by every relay
    pub relay: RelayConfig,
    /// Upstream HTTP proxies, in fallback order
    pub upstreams: Vec<UpstreamConfig>,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Port to listen on (default: 8319)
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream TCP connect timeout (default: 3s)
    pub connect_timeout: Duration,
    /// Upstream send/receive timeout (default: 3s)
    pub read_timeout: Duration,
    /// SO_MARK applied while a request is in flight; `None` leaves sockets unmarked
    pub http_request_mark: Option<u32>,
    /// Verify upstream TLS certificates against the web PKI roots
    pub tls_verify: bool,
}

/// One upstream HTTP proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub priority: i32,
    /// Wrap the upstream connection in TLS
    pub is_secured: bool,
    /// Upstream is a shared public proxy
    pub is_public: bool,
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
        let upstreams = get_env_or("RELAY_UPSTREAMS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_upstream)
            .collect::<Result<Vec<_>>>()?;

        Ok(Config {
            server: ServerConfig {
                host: get_env_or("RELAY_HOST", "127.0.0.1"),
                port: get_env_or("RELAY_PORT", "8319").parse().map_err(|_| {
                    RelayError::InvalidConfig("RELAY_PORT must be a valid port number".into())
                })?,
            },
            relay: RelayConfig {
                connect_timeout: parse_secs("RELAY_CONNECT_TIMEOUT", "3")?,
                read_timeout: parse_secs("RELAY_READ_TIMEOUT", "3")?,
                http_request_mark: match get_env_or("RELAY_HTTP_REQUEST_MARK", "0").parse() {
                    Ok(0) => None,
                    Ok(mark) => Some(mark),
                    Err(_) => {
                        return Err(RelayError::InvalidConfig(
                            "RELAY_HTTP_REQUEST_MARK must be an unsigned 32-bit integer".into(),
                        ))
                    }
                },
                tls_verify: get_env_or("RELAY_TLS_VERIFY", "false").parse().map_err(|_| {
                    RelayError::InvalidConfig("RELAY_TLS_VERIFY must be true or false".into())
                })?,
            },
            upstreams,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the listener address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Parse `http(s)://[user:pass@]host[:port][?public=1&priority=N]`
pub fn parse_upstream(raw: &str) -> Result<UpstreamConfig> {
    let url = Url::parse(raw).map_err(|e| {
        RelayError::InvalidConfig(format!("upstream {} must be a valid URL: {}", raw, e))
    })?;

    if url.fragment().is_some() {
        return Err(RelayError::InvalidConfig(format!(
            "upstream {} must not include a fragment",
            raw
        )));
    }
    if !(url.path().is_empty() || url.path() == "/") {
        return Err(RelayError::InvalidConfig(format!(
            "upstream {} must not include a path",
            raw
        )));
    }

    let is_secured = match url.scheme().to_lowercase().as_str() {
        "http" => false,
        "https" => true,
        other => {
            return Err(RelayError::InvalidConfig(format!(
                "upstream {} has unsupported scheme: {}",
                raw, other
            )))
        }
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RelayError::InvalidConfig(format!("upstream {} must include a host", raw)))?;
    // Bracketed IPv6 literals are stored bare; the connector re-brackets them.
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let port = url
        .port()
        .unwrap_or(if is_secured { 443 } else { 80 });

    let username = Some(url.username())
        .filter(|u| !u.is_empty())
        .map(|u| decode_userinfo(raw, u))
        .transpose()?;
    let password = url
        .password()
        .map(|p| decode_userinfo(raw, p))
        .transpose()?;

    let mut priority = 0;
    let mut is_public = false;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "public" => is_public = matches!(value.as_ref(), "1" | "true" | "yes"),
            "priority" => {
                priority = value.parse().map_err(|_| {
                    RelayError::InvalidConfig(format!(
                        "upstream {} priority must be an integer",
                        raw
                    ))
                })?
            }
            other => {
                return Err(RelayError::InvalidConfig(format!(
                    "upstream {} has unknown option: {}",
                    raw, other
                )))
            }
        }
    }

    Ok(UpstreamConfig {
        host: host.to_string(),
        port,
        username,
        password,
        priority,
        is_secured,
        is_public,
    })
}

/// `Url` keeps userinfo percent-encoded; credentials are sent decoded
fn decode_userinfo(raw: &str, part: &str) -> Result<String> {
    percent_decode_str(part)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| {
            RelayError::InvalidConfig(format!("upstream {} credentials are not valid UTF-8", raw))
        })
}

fn parse_secs(key: &str, default: &str) -> Result<Duration> {
    get_env_or(key, default)
        .parse()
        .map(Duration::from_secs)
        .map_err(|_| RelayError::InvalidConfig(format!("{} must be a number of seconds", key)))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
