//! PostgreSQL adapter configuration
//!
//! Connections always use mutual TLS with full certificate verification.
//! There is no setting that turns it off.
//!
//! ```toml
//! addr = "db.example.com:5432"
//! database = "relkv"
//! user = "relkv"
//! poll_stream_period_ms = 1000
//!
//! [tls]
//! client_cert_file = "/etc/relkv/client.crt"
//! client_key_file = "/etc/relkv/client.key"
//! ca_file = "/etc/relkv/ca.crt"
//! ```

use relkv_core::config::{parse_toml, read_toml};
use relkv_core::{BackendError, Clock, Config, ConfigParams, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Port used when `addr` names only a host
pub const DEFAULT_PORT: u16 = 5432;

/// Database used when none is configured
pub const DEFAULT_DATABASE: &str = "relkv";

/// Role used when none is configured
pub const DEFAULT_USER: &str = "relkv";

/// Client certificate, client key and trusted CA, all PEM encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Client certificate chain
    pub client_cert_file: PathBuf,
    /// PKCS#8 private key for the client certificate
    pub client_key_file: PathBuf,
    /// CA that signed the server certificate
    pub ca_file: PathBuf,
}

/// Validated PostgreSQL adapter configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Server host name; verified against the server certificate
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Role to connect as
    pub user: String,
    /// TLS material
    pub tls: TlsConfig,
    /// Engine-independent settings
    pub backend: Config,
}

impl PostgresConfig {
    /// Configuration for `addr` (`host[:port]`) with default database and
    /// user.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if `addr` cannot be parsed.
    pub fn new(addr: &str, tls: TlsConfig) -> Result<Self> {
        let (host, port) = parse_addr(addr)?;
        Ok(Self {
            host,
            port,
            database: DEFAULT_DATABASE.to_string(),
            user: DEFAULT_USER.to_string(),
            tls,
            backend: Config::default(),
        })
    }

    /// Replace the clock used for lease expiry
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.backend.clock = clock;
        self
    }

    /// Replace the database name
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Replace the role
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Replace the engine-independent settings
    pub fn with_backend(mut self, backend: Config) -> Self {
        self.backend = backend;
        self
    }

    /// `host:port` as configured
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Split `host[:port]`. IPv6 literals must be bracketed when a port is
/// given.
pub fn parse_addr(addr: &str) -> Result<(String, u16)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(BackendError::bad_parameter("addr is required"));
    }

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| BackendError::bad_parameter(format!("invalid addr '{addr}'")))?;
        match tail {
            "" => (host, None),
            _ => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => {
                    return Err(BackendError::bad_parameter(format!("invalid addr '{addr}'")))
                }
            },
        }
    } else {
        match addr.split_once(':') {
            Some((host, port)) if !port.contains(':') => (host, Some(port)),
            // Bare IPv6 literal
            Some(_) => (addr, None),
            None => (addr, None),
        }
    };

    if host.is_empty() {
        return Err(BackendError::bad_parameter(format!(
            "addr '{addr}' has no host"
        )));
    }
    let port = match port {
        None => DEFAULT_PORT,
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| BackendError::bad_parameter(format!("invalid port in '{addr}'")))?,
    };
    Ok((host.to_string(), port))
}

/// File form of [`TlsConfig`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsParams {
    /// Client certificate chain
    #[serde(default)]
    pub client_cert_file: Option<PathBuf>,
    /// PKCS#8 client key
    #[serde(default)]
    pub client_key_file: Option<PathBuf>,
    /// Trusted CA
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn required(path: Option<PathBuf>, name: &str) -> Result<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| BackendError::bad_parameter(format!("tls.{name} is required")))
}

impl TlsParams {
    fn check(self) -> Result<TlsConfig> {
        Ok(TlsConfig {
            client_cert_file: required(self.client_cert_file, "client_cert_file")?,
            client_key_file: required(self.client_key_file, "client_key_file")?,
            ca_file: required(self.ca_file, "ca_file")?,
        })
    }
}

/// File form of [`PostgresConfig`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostgresParams {
    /// `host[:port]`
    #[serde(default)]
    pub addr: Option<String>,
    /// Database name
    #[serde(default)]
    pub database: Option<String>,
    /// Role
    #[serde(default)]
    pub user: Option<String>,
    /// TLS material
    #[serde(default)]
    pub tls: TlsParams,
    /// Engine-independent settings
    #[serde(flatten)]
    pub backend: ConfigParams,
}

impl PostgresParams {
    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        parse_toml(content)
    }

    /// Parse from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        read_toml(path)
    }

    /// Validate and fill defaults.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if `addr` or any TLS file is missing, or if
    /// `addr` is malformed.
    pub fn check_and_set_defaults(self, clock: Arc<dyn Clock>) -> Result<PostgresConfig> {
        let addr = self
            .addr
            .ok_or_else(|| BackendError::bad_parameter("addr is required"))?;
        let (host, port) = parse_addr(&addr)?;
        let non_empty = |v: Option<String>, default: &str| {
            v.filter(|s| !s.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Ok(PostgresConfig {
            host,
            port,
            database: non_empty(self.database, DEFAULT_DATABASE),
            user: non_empty(self.user, DEFAULT_USER),
            tls: self.tls.check()?,
            backend: self.backend.check_and_set_defaults(clock)?,
        })
    }
}
