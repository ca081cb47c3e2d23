use std::fmt;
use std::time::Duration;

use crate::{Error, Result};

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

pub(crate) fn fnv1a(parts: &[&str]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for part in parts {
        for byte in part.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        // unit separator keeps ("ab", "c") and ("a", "bc") apart
        hash ^= 0x1f;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Identity of a logical connection: endpoint, credential, database and container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn of(endpoint: &str, auth_key: &str, database: &str, container: &str) -> Self {
        Self(fnv1a(&[endpoint, auth_key, database, container]))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Read consistency negotiated for every connection. Only session consistency
/// is offered: reads are pinned to the session token of an earlier write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConsistencyLevel {
    #[default]
    Session,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Requests go through a pooling gateway; server-side prepared statements
    /// are not kept between requests.
    #[default]
    Gateway,
    /// Requests go straight to the database server.
    Direct,
}

#[derive(Clone)]
pub struct StoreOptions {
    pub endpoint: String,
    pub auth_key: String,
    pub database: String,
    pub container: String,
    pub connection_mode: ConnectionMode,
    pub max_connections: u32,
    pub connect_timeout: Option<Duration>,
    pub default_page_size: u32,
}

// auth key stays out of logs
impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("endpoint", &self.endpoint)
            .field("auth_key", &"[REDACTED]")
            .field("database", &self.database)
            .field("container", &self.container)
            .field("connection_mode", &self.connection_mode)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .field("default_page_size", &self.default_page_size)
            .finish()
    }
}

impl StoreOptions {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    pub const DEFAULT_PAGE_SIZE: u32 = 100;

    pub fn builder(endpoint: impl Into<String>) -> StoreOptionsBuilder {
        StoreOptionsBuilder::new(endpoint)
    }

    /// Only presence of the required fields is checked.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("endpoint", &self.endpoint),
            ("auth_key", &self.auth_key),
            ("database", &self.database),
            ("container", &self.container),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Configuration(format!("`{name}` must not be empty")));
            }
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(
            &self.endpoint,
            &self.auth_key,
            &self.database,
            &self.container,
        )
    }
}

pub struct StoreOptionsBuilder {
    endpoint: String,
    auth_key: String,
    database: String,
    container: String,
    connection_mode: ConnectionMode,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    default_page_size: Option<u32>,
}

impl StoreOptionsBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_key: String::new(),
            database: String::new(),
            container: String::new(),
            connection_mode: ConnectionMode::default(),
            max_connections: None,
            connect_timeout: None,
            default_page_size: None,
        }
    }

    pub fn auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = key.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    pub fn connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.connection_mode = mode;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn default_page_size(mut self, size: u32) -> Self {
        self.default_page_size = Some(size.max(1));
        self
    }

    pub fn build(self) -> Result<StoreOptions> {
        let options = StoreOptions {
            endpoint: self.endpoint,
            auth_key: self.auth_key,
            database: self.database,
            container: self.container,
            connection_mode: self.connection_mode,
            max_connections: self
                .max_connections
                .unwrap_or(StoreOptions::DEFAULT_MAX_CONNECTIONS),
            connect_timeout: self.connect_timeout,
            default_page_size: self
                .default_page_size
                .unwrap_or(StoreOptions::DEFAULT_PAGE_SIZE),
        };
        options.validate()?;
        Ok(options)
    }
}
