//! Endpoint configuration and connection-string parsing.
//!
//! Connection strings are `key=value` pairs joined with `;`, matched against
//! a fixed field table. Unknown keys are rejected rather than ignored so a
//! typo never silently falls back to a default.

use hakobi_core::pool::PoolConfig;

/// Default port of a Gearman job server.
pub const DEFAULT_PORT: u16 = 4730;

/// One job server address plus its per-operation timeouts.
///
/// Immutable once handed to a transport or pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEndpoint {
    pub host: String,
    pub port: u16,
    pub connect_timeout: std::time::Duration,
    pub send_timeout: std::time::Duration,
    pub receive_timeout: std::time::Duration,
}

impl HostEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: std::time::Duration::from_secs(10),
            send_timeout: std::time::Duration::from_secs(10),
            receive_timeout: std::time::Duration::from_secs(30),
        }
    }

    pub fn connect_timeout(self, connect_timeout: std::time::Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    pub fn send_timeout(self, send_timeout: std::time::Duration) -> Self {
        Self {
            send_timeout,
            ..self
        }
    }

    pub fn receive_timeout(self, receive_timeout: std::time::Duration) -> Self {
        Self {
            receive_timeout,
            ..self
        }
    }
}

/// Endpoint plus pool sizing, as parsed from one connection string.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: HostEndpoint,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingHost,
    /// A segment without a `=` separator.
    MalformedPair(String),
    UnknownKey(String),
    InvalidValue {
        key: String,
        value: String,
    },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => f.write_str("connection string is empty"),
            ParseError::MissingHost => f.write_str("connection string has no host"),
            ParseError::MalformedPair(segment) => {
                write!(f, "segment {segment:?} is not a key=value pair")
            }
            ParseError::UnknownKey(key) => write!(f, "unknown connection-string key {key:?}"),
            ParseError::InvalidValue { key, value } => {
                write!(f, "invalid value {value:?} for key {key:?}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl std::str::FromStr for ServerConfig {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let mut host: Option<String> = None;
        let mut port = DEFAULT_PORT;
        let mut endpoint_defaults = HostEndpoint::new("", DEFAULT_PORT);
        let mut pool = PoolConfig::default();

        for segment in raw.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ParseError::MalformedPair(segment.to_owned()))?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "host" => host = Some(value.to_owned()),
                "port" => port = parse_number(&key, value)?,
                "connecttimeout" => {
                    endpoint_defaults.connect_timeout = parse_millis(&key, value)?
                }
                "sendtimeout" => endpoint_defaults.send_timeout = parse_millis(&key, value)?,
                "receivetimeout" => {
                    endpoint_defaults.receive_timeout = parse_millis(&key, value)?
                }
                "maxpoolsize" => pool.max_connections = parse_number(&key, value)?,
                "connectionmaxage" => pool.connection_max_age = parse_millis(&key, value)?,
                "newconnectiontimeout" => {
                    pool.new_connection_timeout = parse_millis(&key, value)?
                }
                "healtherrorthreshold" => {
                    pool.health_error_threshold = parse_number(&key, value)?
                }
                "healthcheckinterval" => {
                    pool.health_check_interval = parse_millis(&key, value)?
                }
                _ => return Err(ParseError::UnknownKey(key)),
            }
        }

        let host = host.filter(|h| !h.is_empty()).ok_or(ParseError::MissingHost)?;
        let endpoint = HostEndpoint {
            host,
            port,
            ..endpoint_defaults
        };
        Ok(ServerConfig { endpoint, pool })
    }
}

fn parse_number<N: std::str::FromStr>(key: &str, value: &str) -> Result<N, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_millis(key: &str, value: &str) -> Result<std::time::Duration, ParseError> {
    parse_number::<u64>(key, value).map(std::time::Duration::from_millis)
}
