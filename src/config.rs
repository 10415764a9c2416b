//! Handle configuration.
//!
//! Values arrive already resolved: build a [`DbConfig`] with the builder
//! methods, deserialize it with `serde` from whatever format the application
//! uses, or parse a connection URL.

use std::fmt;

use serde::Deserialize;

use crate::driver::{ConnectParams, Vendor};
use crate::error::{DbError, Result};

/// Pool size used when none is configured.
pub const DEFAULT_POOL_SIZE: usize = 10;

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

/// Everything needed to create a database handle.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct DbConfig {
    pub vendor: Vendor,
    pub host: String,
    /// `None` selects the vendor's default port.
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Role assumed after authentication; empty for none.
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl DbConfig {
    /// Create a configuration with default port, no password, no role and
    /// the default pool size.
    pub fn new(
        vendor: Vendor,
        host: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            vendor,
            host: host.into(),
            port: None,
            database: database.into(),
            user: user.into(),
            password: String::new(),
            role: String::new(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the role assumed after authentication.
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Set the number of pooled connections.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Parse `postgres[ql]://user:password@host:port/database?role=r&pool_size=n`.
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("postgresql://")
            .or_else(|| url.strip_prefix("postgres://"))
            .ok_or_else(|| DbError::ConfigError(format!("unsupported URL scheme: {}", url)))?;

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };

        let (credentials, location) = match rest.rsplit_once('@') {
            Some((credentials, location)) => (credentials, location),
            None => ("", rest),
        };

        let (user, password) = match credentials.split_once(':') {
            Some((user, password)) => (user, password),
            None => (credentials, ""),
        };

        let (host_port, database) = location.split_once('/').unwrap_or((location, ""));

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| DbError::ConfigError(format!("invalid port: {}", port)))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };

        let mut config = DbConfig::new(Vendor::Postgres, host, database, user).password(password);
        config.port = port;

        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            match pair.split_once('=') {
                Some(("role", role)) => config.role = role.to_string(),
                Some(("pool_size", size)) => {
                    config.pool_size = size.parse().map_err(|_| {
                        DbError::ConfigError(format!("invalid pool_size: {}", size))
                    })?;
                }
                _ => {}
            }
        }

        Ok(config)
    }

    /// Port after applying the vendor default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.vendor.default_port())
    }

    /// Pool size clamped to at least one connection.
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.max(1)
    }

    /// Reject configurations that can never connect.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("host", &self.host),
            ("database", &self.database),
            ("user", &self.user),
        ] {
            if value.is_empty() {
                return Err(DbError::ConfigError(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }

    /// Resolved parameters handed to the driver.
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            host: self.host.clone(),
            port: self.effective_port(),
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            role: self.role.clone(),
        }
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("vendor", &self.vendor)
            .field("host", &self.host)
            .field("port", &self.effective_port())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("role", &self.role)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}
