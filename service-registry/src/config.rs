use std::env;
use std::fmt;
use std::time::Duration;

use crate::redis_store::DEFAULT_SESSION_TTL_SECS;
use crate::registry::DEFAULT_REGISTRY_ROOT;
use crate::store::validate_path;
use crate::{Error, Role};

const DEFAULT_PORT: u16 = 8080;

/// Which coordination service backs the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// Shared Redis instance; membership spans processes.
    #[default]
    Redis,
    /// In-process store; membership is local to this process.
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Node settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub backend: Backend,
    pub redis_url: Option<String>,
    pub key_prefix: Option<String>,
    pub registry_root: String,
    pub port: u16,
    pub advertised_host: Option<String>,
    pub role: Role,
    pub session_ttl: Duration,
}

impl NodeConfig {
    /// Read `REGISTRY_BACKEND`, `REDIS_URL`, `REGISTRY_KEY_PREFIX`,
    /// `REGISTRY_ROOT`, `SERVER_PORT`, `ADVERTISED_HOST`, `NODE_ROLE` and
    /// `SESSION_TTL_SECS`.
    ///
    /// # Errors
    ///
    /// Returns every invalid or missing setting in one [`Error::Config`].
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut errors = Vec::new();

        let backend = match lookup("REGISTRY_BACKEND").as_deref() {
            None | Some("redis") => Backend::Redis,
            Some("memory") => Backend::Memory,
            Some(other) => {
                errors.push(format!("REGISTRY_BACKEND must be redis or memory, got '{}'", other));
                Backend::Redis
            }
        };

        let redis_url = lookup("REDIS_URL");
        if backend == Backend::Redis && redis_url.is_none() {
            errors.push("REDIS_URL must be set when REGISTRY_BACKEND=redis".to_string());
        }

        let registry_root =
            lookup("REGISTRY_ROOT").unwrap_or_else(|| DEFAULT_REGISTRY_ROOT.to_string());
        if registry_root == "/" || validate_path(&registry_root).is_err() {
            errors.push(format!(
                "REGISTRY_ROOT must be an absolute non-root path, got '{}'",
                registry_root
            ));
        }

        let port = match lookup("SERVER_PORT") {
            None => DEFAULT_PORT,
            Some(raw) => raw.parse::<u16>().unwrap_or_else(|_| {
                errors.push(format!("SERVER_PORT must be a port number, got '{}'", raw));
                DEFAULT_PORT
            }),
        };

        let role = match lookup("NODE_ROLE") {
            None => Role::Worker,
            Some(raw) => raw.parse::<Role>().unwrap_or_else(|e| {
                errors.push(format!("NODE_ROLE: {}", e));
                Role::Worker
            }),
        };

        let session_ttl = match lookup("SESSION_TTL_SECS") {
            None => Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    errors.push(format!(
                        "SESSION_TTL_SECS must be a positive integer, got '{}'",
                        raw
                    ));
                    Duration::from_secs(DEFAULT_SESSION_TTL_SECS)
                }
            },
        };

        if !errors.is_empty() {
            return Err(Error::Config(format!(
                "Invalid environment:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(Self {
            backend,
            redis_url,
            key_prefix: lookup("REGISTRY_KEY_PREFIX"),
            registry_root,
            port,
            advertised_host: lookup("ADVERTISED_HOST").filter(|h| !h.trim().is_empty()),
            role,
            session_ttl,
        })
    }
}
