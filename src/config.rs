use crate::adapter::{TcpServerAdapter, TcpServerConfig};
use crate::connectable::Connectable;
use crate::error::WyomingError;
use crate::server::ServerOptions;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_URI: &str = "tcp://0.0.0.0:10300";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Unsupported URI scheme in '{0}': only tcp:// is available")]
    UnsupportedScheme(String),
    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

impl From<ConfigError> for WyomingError {
    fn from(err: ConfigError) -> Self {
        WyomingError::Configuration(err.to_string())
    }
}

/// A `tcp://host:port` address to serve on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse_uri(uri: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let rest = match uri.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some(_) => return Err(ConfigError::UnsupportedScheme(uri.to_string())),
            None => return Err(invalid("expected tcp://host:port")),
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port
            .trim_end_matches('/')
            .parse::<u16>()
            .map_err(|e| invalid(&format!("bad port: {}", e)))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// `host:port` form accepted by socket APIs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_uri(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// Service configuration, from the environment (and `.env`)
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub endpoints: Vec<Endpoint>,
    pub handler_timeout: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![Endpoint {
                host: "0.0.0.0".to_string(),
                port: 10300,
            }],
            handler_timeout: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables
    ///
    /// - `WYOMING_URI`: comma separated list of `tcp://host:port` URIs
    /// - `WYOMING_HANDLER_TIMEOUT_MS`: optional handler timeout
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(uris) = lookup("WYOMING_URI") {
            config.endpoints = Self::parse_uris(&uris)?;
        }

        if let Some(timeout) = lookup("WYOMING_HANDLER_TIMEOUT_MS") {
            let millis = timeout
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::InvalidValue {
                    var: "WYOMING_HANDLER_TIMEOUT_MS".to_string(),
                    reason: e.to_string(),
                })?;
            config.handler_timeout = Some(Duration::from_millis(millis));
        }

        Ok(config)
    }

    pub fn parse_uris(uris: &str) -> Result<Vec<Endpoint>, ConfigError> {
        let endpoints = uris
            .split(',')
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .map(Endpoint::parse_uri)
            .collect::<Result<Vec<_>, _>>()?;

        if endpoints.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "WYOMING_URI".to_string(),
                reason: "no URI given".to_string(),
            });
        }
        Ok(endpoints)
    }

    /// One listening adapter per endpoint
    pub fn adapters(&self) -> Vec<Arc<dyn Connectable>> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(TcpServerAdapter::new(TcpServerConfig {
                    bind_address: endpoint.address(),
                })) as Arc<dyn Connectable>
            })
            .collect()
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            handler_timeout: self.handler_timeout,
        }
    }
}
